//! Entry/exit attachment of the probe programs to one kernel function.

use std::fmt;

use log::{info, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::telemetry;

pub mod kernel;

pub use kernel::{KernelProbes, TARGET_FUNCTION};

/// Which side of the traced call a probe fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePoint {
    Entry,
    Exit,
}

impl fmt::Display for ProbePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbePoint::Entry => f.write_str("entry"),
            ProbePoint::Exit => f.write_str("exit"),
        }
    }
}

/// How the programs are bound to the target function.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// BTF trampolines (fentry/fexit). Needs a kernel with BTF.
    #[default]
    Fentry,
    /// kprobe + kretprobe.
    Kprobe,
}

impl fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeMode::Fentry => f.write_str("fentry"),
            ProbeMode::Kprobe => f.write_str("kprobe"),
        }
    }
}

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("program {program} not found in the loaded object")]
    ProgramNotFound { program: String },

    #[error("failed to attach {point} probe to {target}: {error}")]
    AttachFailed {
        point: ProbePoint,
        target: String,
        error: String,
    },

    #[error("failed to detach {point} probe from {target}: {error}")]
    DetachFailed {
        point: ProbePoint,
        target: String,
        error: String,
    },
}

/// Kernel-side link that can be torn down exactly once.
pub trait Detach {
    fn detach(self: Box<Self>) -> anyhow::Result<()>;
}

/// A live binding between a loaded program and the target function.
///
/// Owns its kernel link. Dropping an attachment that was not released
/// releases it. The `active_probes` gauge follows the link: 1 from creation
/// until a successful release.
pub struct Attachment {
    point: ProbePoint,
    target: String,
    link: Option<Box<dyn Detach>>,
}

impl Attachment {
    pub fn new(point: ProbePoint, target: impl Into<String>, link: impl Detach + 'static) -> Self {
        let attachment = Self {
            point,
            target: target.into(),
            link: Some(Box::new(link)),
        };
        telemetry::record_active_probe(&attachment.gauge_key(), 1);
        attachment
    }

    /// Label of this attachment on the `active_probes` gauge.
    pub fn gauge_key(&self) -> String {
        format!("{}:{}", self.point, self.target)
    }

    pub fn point(&self) -> ProbePoint {
        self.point
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }

    /// Detach from the kernel. Releasing an already released attachment is a no-op.
    pub fn release(&mut self) -> Result<(), AttachError> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        link.detach().map_err(|e| AttachError::DetachFailed {
            point: self.point,
            target: self.target.clone(),
            error: format!("{e:#}"),
        })?;
        telemetry::record_active_probe(&self.gauge_key(), 0);
        info!("Detached {} probe from {}", self.point, self.target);
        Ok(())
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("{}", e);
        }
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("point", &self.point)
            .field("target", &self.target)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Attaches the paired entry/exit probes to one kernel function.
pub trait ProbeAttacher {
    fn target(&self) -> &str;

    fn attach_entry(&mut self) -> Result<Attachment, AttachError>;

    fn attach_exit(&mut self) -> Result<Attachment, AttachError>;
}

/// Undo list of acquired attachments, released last-in first-out.
#[derive(Debug, Default)]
pub struct AttachmentStack {
    attachments: Vec<Attachment>,
}

impl AttachmentStack {
    pub fn push(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    pub fn len(&self) -> usize {
        self.attachments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }

    /// Release everything in reverse acquisition order.
    ///
    /// A failed detach does not stop the remaining releases; failures are returned.
    pub fn unwind(&mut self) -> Vec<AttachError> {
        let mut failures = Vec::new();
        while let Some(mut attachment) = self.attachments.pop() {
            if let Err(e) = attachment.release() {
                warn!("{}", e);
                failures.push(e);
            }
        }
        failures
    }
}

impl Drop for AttachmentStack {
    fn drop(&mut self) {
        self.unwind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Journal = Arc<Mutex<Vec<String>>>;

    struct RecordingLink {
        name: &'static str,
        journal: Journal,
        fail: bool,
    }

    impl Detach for RecordingLink {
        fn detach(self: Box<Self>) -> anyhow::Result<()> {
            self.journal.lock().unwrap().push(self.name.to_string());
            if self.fail {
                anyhow::bail!("link already gone");
            }
            Ok(())
        }
    }

    fn attachment(point: ProbePoint, name: &'static str, journal: &Journal) -> Attachment {
        Attachment::new(
            point,
            "do_sys_openat2",
            RecordingLink {
                name,
                journal: journal.clone(),
                fail: false,
            },
        )
    }

    #[test]
    fn test_release_is_idempotent() {
        let journal = Journal::default();
        let mut entry = attachment(ProbePoint::Entry, "entry", &journal);
        assert!(entry.is_attached());

        entry.release().unwrap();
        entry.release().unwrap();
        drop(entry);

        assert_eq!(*journal.lock().unwrap(), vec!["entry"]);
    }

    #[test]
    fn test_drop_releases_attachment() {
        let journal = Journal::default();
        drop(attachment(ProbePoint::Exit, "exit", &journal));
        assert_eq!(journal.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_stack_unwinds_in_reverse_order() {
        let journal = Journal::default();
        let mut stack = AttachmentStack::default();
        stack.push(attachment(ProbePoint::Entry, "entry", &journal));
        stack.push(attachment(ProbePoint::Exit, "exit", &journal));
        assert_eq!(stack.len(), 2);

        assert!(stack.unwind().is_empty());
        assert!(stack.is_empty());
        assert_eq!(*journal.lock().unwrap(), vec!["exit", "entry"]);
    }

    #[test]
    fn test_stack_continues_after_detach_failure() {
        let journal = Journal::default();
        let mut stack = AttachmentStack::default();
        stack.push(attachment(ProbePoint::Entry, "entry", &journal));
        stack.push(Attachment::new(
            ProbePoint::Exit,
            "do_sys_openat2",
            RecordingLink {
                name: "exit",
                journal: journal.clone(),
                fail: true,
            },
        ));

        let failures = stack.unwind();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0],
            AttachError::DetachFailed {
                point: ProbePoint::Exit,
                ..
            }
        ));
        assert_eq!(*journal.lock().unwrap(), vec!["exit", "entry"]);
    }

    #[test]
    fn test_gauge_drops_when_released_during_unwind() {
        let journal = Journal::default();
        let mut stack = AttachmentStack::default();
        let entry = Attachment::new(
            ProbePoint::Entry,
            "gauge_ok",
            RecordingLink {
                name: "entry",
                journal: journal.clone(),
                fail: false,
            },
        );
        let exit = Attachment::new(
            ProbePoint::Exit,
            "gauge_ok",
            RecordingLink {
                name: "exit",
                journal: journal.clone(),
                fail: true,
            },
        );
        assert_eq!(telemetry::active_probe_count("entry:gauge_ok"), Some(1));
        assert_eq!(telemetry::active_probe_count("exit:gauge_ok"), Some(1));

        stack.push(entry);
        stack.push(exit);
        stack.unwind();

        assert_eq!(telemetry::active_probe_count("entry:gauge_ok"), Some(0));
        // A link that refused to detach is still counted.
        assert_eq!(telemetry::active_probe_count("exit:gauge_ok"), Some(1));
    }

    #[test]
    fn test_attach_error_display() {
        let err = AttachError::AttachFailed {
            point: ProbePoint::Entry,
            target: "no_such_fn".to_string(),
            error: "ENOENT".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to attach entry probe to no_such_fn: ENOENT"
        );
    }
}
