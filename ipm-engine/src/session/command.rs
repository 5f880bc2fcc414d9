//! Command line for the external patch tool.

use crate::error::PatchError;
use crate::handler::targets::profile;
use ipm_common::remote::quote;
use ipm_common::types::{Operation, PatchRequest, TargetKind};

/// Where one session keeps its files on the launch node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub patch_base: String,
    pub log_dir: String,
    pub console: String,
    pub notifications: String,
    pub node_list: String,
    pub marker: String,
}

impl SessionPaths {
    pub fn new(patch_base: &str, request: &PatchRequest) -> Self {
        let base = patch_base.trim_end_matches('/');
        let kind = request.target_kind.as_str();
        let log_dir = format!("{base}/ipm_logs/{}_{kind}", request.request_id);
        Self {
            patch_base: base.to_string(),
            console: format!("{log_dir}/PatchmgrConsole.out"),
            notifications: format!("{log_dir}/notifications"),
            node_list: node_list_path(base, request.target_kind),
            marker: format!("{base}/.ipm_session_{kind}"),
            log_dir,
        }
    }
}

pub fn node_list_path(patch_base: &str, kind: TargetKind) -> String {
    format!("{}/{}_group", patch_base.trim_end_matches('/'), kind.as_str())
}

fn operation_flags(request: &PatchRequest) -> Result<Vec<String>, PatchError> {
    let op = request.operation;
    if !op.invokes_tool() {
        return Err(PatchError::UnsupportedOperation(op));
    }
    let rolling = request.operation_style.is_rolling();
    let mut flags: Vec<String> = Vec::new();

    match request.target_kind {
        TargetKind::Dom0 | TargetKind::DomU => {
            push(&mut flags, match op {
                Operation::PrereqCheck => "--precheck",
                Operation::Patch => "--upgrade",
                Operation::RollbackPrereqCheck => "--precheck --rollback",
                _ => "--rollback",
            });
            if op.is_forward() {
                if let Some(repo) = &request.iso_repo {
                    push(&mut flags, "--iso_repo");
                    flags.push(quote(repo));
                }
                flags.push("--target_version".into());
                flags.push(quote(&request.target_version));
            }
            if rolling && op.changes_version() {
                flags.push("--rolling".into());
            }
            if request.target_kind == TargetKind::Dom0 && request.live_update {
                flags.extend(["--live-update-target".into(), "allcvss".into()]);
                if op == Operation::Patch {
                    flags.extend([
                        "--live-update-schedule-outstanding-work".into(),
                        "never".into(),
                    ]);
                }
            }
        }
        TargetKind::Cell => {
            push(&mut flags, match op {
                Operation::PrereqCheck => "--patch_check_prereq",
                Operation::Patch => "--patch",
                Operation::RollbackPrereqCheck => "--rollback_check_prereq",
                _ => "--rollback",
            });
            if rolling {
                flags.push("--rolling".into());
            }
        }
        TargetKind::IbSwitch => push(&mut flags, match op {
            Operation::PrereqCheck => "--upgrade --ibswitch_precheck --force",
            Operation::Patch => "--upgrade --force",
            Operation::RollbackPrereqCheck => "--downgrade --ibswitch_precheck --force",
            _ => "--downgrade --force",
        }),
        TargetKind::RoceSwitch => push(&mut flags, match op {
            Operation::PrereqCheck => "--upgrade --roceswitch-precheck",
            Operation::Patch => "--upgrade",
            Operation::RollbackPrereqCheck => "--downgrade --roceswitch-precheck",
            _ => "--downgrade",
        }),
    }
    Ok(flags)
}

fn push(flags: &mut Vec<String>, words: &str) {
    flags.extend(words.split_whitespace().map(str::to_string));
}

/// Build the detached launch command.
///
/// The tool is started with `nohup` and its output redirected to the
/// console file, so it keeps running if the orchestrator dies.
pub fn build_command(request: &PatchRequest, paths: &SessionPaths) -> Result<String, PatchError> {
    let flags = operation_flags(request)?;
    let target_flag = profile(request.target_kind).tool_flag;
    Ok(format!(
        "cd {base}; nohup ./patchmgr --{target_flag} {list} {flags} --log_dir {log_dir} </dev/null &> {console} &",
        base = quote(&paths.patch_base),
        list = quote(&paths.node_list),
        flags = flags.join(" "),
        log_dir = quote(&paths.log_dir),
        console = quote(&paths.console),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipm_common::types::OperationStyle;

    fn request(kind: TargetKind, op: Operation) -> PatchRequest {
        PatchRequest::new(kind, op, "21.2.11.0.0.220414.1", vec!["db01".into()], vec!["n1".into()])
    }

    fn command(request: &PatchRequest) -> String {
        build_command(request, &SessionPaths::new("/u01/patches/", request)).unwrap()
    }

    #[test]
    fn test_paths_are_scoped_by_request_and_kind() {
        let request = request(TargetKind::Cell, Operation::Patch);
        let paths = SessionPaths::new("/u01/patches/", &request);
        assert_eq!(paths.node_list, "/u01/patches/cell_group");
        assert_eq!(paths.marker, "/u01/patches/.ipm_session_cell");
        assert!(paths.log_dir.ends_with(&format!("{}_cell", request.request_id)));
        assert!(paths.console.starts_with(&paths.log_dir));
    }

    #[test]
    fn test_cell_rolling_patch() {
        let cmd = command(&request(TargetKind::Cell, Operation::Patch));
        assert!(cmd.starts_with("cd /u01/patches; nohup ./patchmgr --cells /u01/patches/cell_group --patch --rolling --log_dir"));
        assert!(cmd.ends_with("PatchmgrConsole.out &"));
        assert!(cmd.contains("</dev/null &>"));
    }

    #[test]
    fn test_domu_precheck_carries_repo_and_version() {
        let mut req = request(TargetKind::DomU, Operation::PrereqCheck);
        req.iso_repo = Some("/repo/exadata.zip".into());
        let cmd = command(&req);
        assert!(cmd.contains("--dbnodes /u01/patches/domu_group --precheck --iso_repo /repo/exadata.zip --target_version 21.2.11.0.0.220414.1 --log_dir"));
        assert!(!cmd.contains("--rolling"));
    }

    #[test]
    fn test_non_rolling_rollback_has_no_rolling_flag() {
        let req = request(TargetKind::Dom0, Operation::Rollback).with_style(OperationStyle::NonRolling);
        let cmd = command(&req);
        assert!(cmd.contains("--rollback --log_dir"));
        assert!(!cmd.contains("--target_version"));
    }

    #[test]
    fn test_dom0_live_update() {
        let mut req = request(TargetKind::Dom0, Operation::Patch).live_update();
        req.target_version = "LATEST".into();
        let cmd = command(&req);
        assert!(cmd.contains("--target_version LATEST --rolling --live-update-target allcvss --live-update-schedule-outstanding-work never"));
    }

    #[test]
    fn test_switch_flags() {
        assert!(command(&request(TargetKind::IbSwitch, Operation::RollbackPrereqCheck))
            .contains("--ibswitches /u01/patches/ibswitch_group --downgrade --ibswitch_precheck --force --log_dir"));
        assert!(command(&request(TargetKind::RoceSwitch, Operation::Patch))
            .contains("--roceswitches /u01/patches/roceswitch_group --upgrade --log_dir"));
    }

    #[test]
    fn test_postcheck_and_oneoff_are_not_tool_operations() {
        for op in [Operation::Postcheck, Operation::Oneoff] {
            let req = request(TargetKind::Cell, op);
            let err = build_command(&req, &SessionPaths::new("/p", &req)).unwrap_err();
            assert_eq!(err, PatchError::UnsupportedOperation(op));
        }
    }
}
