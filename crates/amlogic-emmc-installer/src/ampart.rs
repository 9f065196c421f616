//! One-shot interaction with the `ampart` partition tool.
//!
//! We ask it to clone the vendor layout down to a single `data` partition,
//! then read the snapshot back. Only an exact echo of the requested layout
//! counts as success; anything else leaves the rule-chain offsets in charge.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum RepartitionOutcome {
    Applied,
    Mismatch { requested: String, reported: String },
    Unavailable { reason: String },
}

impl RepartitionOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, RepartitionOutcome::Applied)
    }
}

/// Runs a program and returns its stdout, failing on spawn error or non-zero exit.
pub trait ToolRunner {
    fn capture(&self, program: &str, args: &[String]) -> Result<String>;
}

pub fn clone_args(device: &str, layout: &str) -> Vec<String> {
    vec![
        device.to_string(),
        "--mode".into(),
        "dclone".into(),
        layout.to_string(),
    ]
}

pub fn snapshot_args(device: &str) -> Vec<String> {
    vec![device.to_string(), "--mode".into(), "dsnapshot".into()]
}

fn reported_layout(stdout: &str) -> String {
    stdout
        .lines()
        .map(|l| l.trim_end_matches(['\r', '\n']))
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default()
        .to_string()
}

pub fn repartition(
    runner: &dyn ToolRunner,
    program: &str,
    device: &str,
    layout: &str,
) -> RepartitionOutcome {
    if let Err(e) = runner.capture(program, &clone_args(device, layout)) {
        warn!("{program} could not relayout {device}: {e}");
        return RepartitionOutcome::Unavailable {
            reason: e.to_string(),
        };
    }
    let snapshot = match runner.capture(program, &snapshot_args(device)) {
        Ok(s) => s,
        Err(e) => {
            warn!("{program} could not read back {device}: {e}");
            return RepartitionOutcome::Unavailable {
                reason: e.to_string(),
            };
        }
    };

    let reported = reported_layout(&snapshot);
    if reported == layout {
        info!("{program} relaid {device} as {layout}");
        RepartitionOutcome::Applied
    } else {
        warn!("{program} reported '{reported}', expected '{layout}'; falling back to board offsets");
        RepartitionOutcome::Mismatch {
            requested: layout.to_string(),
            reported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use std::cell::RefCell;

    struct Scripted {
        replies: RefCell<Vec<Result<String>>>,
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: RefCell::new(replies),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ToolRunner for Scripted {
        fn capture(&self, _program: &str, args: &[String]) -> Result<String> {
            self.calls.borrow_mut().push(args.to_vec());
            self.replies.borrow_mut().remove(0)
        }
    }

    #[test]
    fn exact_readback_is_applied() {
        let r = Scripted::new(vec![Ok(String::new()), Ok("data::-1:4\n".into())]);
        let out = repartition(&r, "ampart", "/dev/mmcblk2", "data::-1:4");
        assert_eq!(out, RepartitionOutcome::Applied);
        let calls = r.calls.borrow();
        assert_eq!(calls[0], clone_args("/dev/mmcblk2", "data::-1:4"));
        assert_eq!(calls[1], snapshot_args("/dev/mmcblk2"));
    }

    #[test]
    fn trailing_space_is_a_mismatch() {
        let r = Scripted::new(vec![Ok(String::new()), Ok("data::-1:4 \n".into())]);
        let out = repartition(&r, "ampart", "/dev/mmcblk2", "data::-1:4");
        assert!(matches!(out, RepartitionOutcome::Mismatch { .. }));
    }

    #[test]
    fn failed_clone_skips_readback() {
        let r = Scripted::new(vec![Err(Error::new(ErrorKind::ExternalTool, "not found"))]);
        let out = repartition(&r, "ampart", "/dev/mmcblk2", "data::-1:4");
        assert!(matches!(out, RepartitionOutcome::Unavailable { .. }));
        assert_eq!(r.calls.borrow().len(), 1);
    }
}
