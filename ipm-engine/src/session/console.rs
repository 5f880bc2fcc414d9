//! Console output grammar of the patch tool.

/// Classification of one console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleLine {
    Progress(String),
    /// `Exit status:<n>`; an unparseable status is reported as -1.
    Terminator(i32),
    Other,
}

pub fn classify(line: &str) -> ConsoleLine {
    let lower = line.to_ascii_lowercase();
    if let Some(pos) = lower.find("exit status") {
        let rest = &line[pos + "exit status".len()..];
        let status = rest
            .trim_start()
            .strip_prefix(':')
            .map(str::trim)
            .and_then(|s| {
                let digits: String = s
                    .chars()
                    .enumerate()
                    .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '-'))
                    .map(|(_, c)| c)
                    .collect();
                digits.parse().ok()
            })
            .unwrap_or(-1);
        return ConsoleLine::Terminator(status);
    }
    if ["working", "success", "info"].iter().any(|k| lower.contains(k)) {
        return ConsoleLine::Progress(line.trim().to_string());
    }
    ConsoleLine::Other
}

/// What a full console read says about the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleScan {
    pub last_progress: Option<String>,
    pub terminator: Option<i32>,
}

impl ConsoleScan {
    pub fn finished(&self) -> bool {
        self.terminator.is_some()
    }
}

/// Scan the whole console. The first terminator wins.
pub fn scan(text: &str) -> ConsoleScan {
    let mut result = ConsoleScan::default();
    for line in text.lines() {
        match classify(line) {
            ConsoleLine::Terminator(status) => {
                result.terminator = Some(status);
                break;
            }
            ConsoleLine::Progress(p) => result.last_progress = Some(p),
            ConsoleLine::Other => {}
        }
    }
    result
}

/// Last `n` lines of `text`.
pub fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}
