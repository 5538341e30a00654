use anyhow::{Context, Result};
use aya::{
    Btf, Ebpf,
    maps::RingBuf,
    programs::{FEntry, FExit, KProbe, Program, ProgramError, links::Link},
};
use aya_log::EbpfLogger;
use log::{info, warn};

use crate::pipeline::ProbeBackend;
use crate::probes::{AttachError, Attachment, Detach, ProbeAttacher, ProbeMode, ProbePoint};
use crate::ringbuf::{CloseSignal, RingBufferSource};

/// The programs read `do_sys_openat2`'s argument layout
/// `(int dfd, const char __user *filename, struct open_how *how)`, so they are
/// only ever bound to this function.
pub const TARGET_FUNCTION: &str = "do_sys_openat2";

const FENTRY_PROGRAM: &str = "fentry_do_sys_openat2";
const FEXIT_PROGRAM: &str = "fexit_do_sys_openat2";
const KPROBE_PROGRAM: &str = "kprobe_do_sys_openat2";
const KRETPROBE_PROGRAM: &str = "kretprobe_do_sys_openat2";

const EVENTS_MAP: &str = "EVENTS";

/// Owned aya link; detaching it removes the kernel attachment.
struct KernelLink<L: Link>(L);

impl<L: Link> Detach for KernelLink<L> {
    fn detach(self: Box<Self>) -> anyhow::Result<()> {
        self.0.detach().map_err(|e| anyhow::anyhow!("{e}"))
    }
}

/// The loaded eBPF object in one probe mode.
///
/// Programs stay loaded until this value is dropped.
pub struct KernelProbes {
    bpf: Ebpf,
    mode: ProbeMode,
}

impl KernelProbes {
    /// Load the object and both programs of the selected mode against [`TARGET_FUNCTION`].
    pub fn load(bytecode: &[u8], mode: ProbeMode) -> Result<Self> {
        let mut bpf = Ebpf::load(bytecode).context("Failed to load eBPF object")?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }

        match mode {
            ProbeMode::Fentry => {
                let btf = Btf::from_sys_fs().context("Failed to read kernel BTF")?;

                let entry: &mut FEntry = program_mut(&mut bpf, FENTRY_PROGRAM)?;
                entry
                    .load(TARGET_FUNCTION, &btf)
                    .with_context(|| format!("Failed to load {}", FENTRY_PROGRAM))?;

                let exit: &mut FExit = program_mut(&mut bpf, FEXIT_PROGRAM)?;
                exit.load(TARGET_FUNCTION, &btf)
                    .with_context(|| format!("Failed to load {}", FEXIT_PROGRAM))?;
            }
            ProbeMode::Kprobe => {
                for name in [KPROBE_PROGRAM, KRETPROBE_PROGRAM] {
                    let program: &mut KProbe = program_mut(&mut bpf, name)?;
                    program
                        .load()
                        .with_context(|| format!("Failed to load {}", name))?;
                }
            }
        }

        info!("Loaded {} programs for {}", mode, TARGET_FUNCTION);
        Ok(Self { bpf, mode })
    }

    pub fn mode(&self) -> ProbeMode {
        self.mode
    }

    fn attach_kprobe(&mut self, point: ProbePoint, name: &str) -> Result<Attachment, AttachError> {
        let program: &mut KProbe = program_mut(&mut self.bpf, name)?;
        let link_id = program
            .attach(TARGET_FUNCTION, 0)
            .map_err(|e| attach_failed(point, e))?;
        let link = program
            .take_link(link_id)
            .map_err(|e| attach_failed(point, e))?;
        Ok(Attachment::new(point, TARGET_FUNCTION, KernelLink(link)))
    }
}

impl ProbeAttacher for KernelProbes {
    fn target(&self) -> &str {
        TARGET_FUNCTION
    }

    fn attach_entry(&mut self) -> Result<Attachment, AttachError> {
        let attachment = match self.mode {
            ProbeMode::Fentry => {
                let program: &mut FEntry = program_mut(&mut self.bpf, FENTRY_PROGRAM)?;
                let link_id = program
                    .attach()
                    .map_err(|e| attach_failed(ProbePoint::Entry, e))?;
                let link = program
                    .take_link(link_id)
                    .map_err(|e| attach_failed(ProbePoint::Entry, e))?;
                Attachment::new(ProbePoint::Entry, TARGET_FUNCTION, KernelLink(link))
            }
            ProbeMode::Kprobe => self.attach_kprobe(ProbePoint::Entry, KPROBE_PROGRAM)?,
        };

        info!("Attached {} entry probe: {}", self.mode, TARGET_FUNCTION);
        Ok(attachment)
    }

    fn attach_exit(&mut self) -> Result<Attachment, AttachError> {
        let attachment = match self.mode {
            ProbeMode::Fentry => {
                let program: &mut FExit = program_mut(&mut self.bpf, FEXIT_PROGRAM)?;
                let link_id = program
                    .attach()
                    .map_err(|e| attach_failed(ProbePoint::Exit, e))?;
                let link = program
                    .take_link(link_id)
                    .map_err(|e| attach_failed(ProbePoint::Exit, e))?;
                Attachment::new(ProbePoint::Exit, TARGET_FUNCTION, KernelLink(link))
            }
            ProbeMode::Kprobe => self.attach_kprobe(ProbePoint::Exit, KRETPROBE_PROGRAM)?,
        };

        info!("Attached {} exit probe: {}", self.mode, TARGET_FUNCTION);
        Ok(attachment)
    }
}

impl ProbeBackend for KernelProbes {
    type Source = RingBufferSource;

    fn open_buffer(&mut self, signal: CloseSignal) -> Result<RingBufferSource> {
        let ring_buf = RingBuf::try_from(
            self.bpf
                .take_map(EVENTS_MAP)
                .with_context(|| format!("Failed to find {} map", EVENTS_MAP))?,
        )?;
        let source = RingBufferSource::new(ring_buf, signal)
            .context("Failed to register ring buffer with the runtime")?;
        info!("Opened ring buffer reader on {}", EVENTS_MAP);
        Ok(source)
    }
}

impl Drop for KernelProbes {
    fn drop(&mut self) {
        info!("Unloading {} programs for {}", self.mode, TARGET_FUNCTION);
    }
}

fn program_mut<'a, P>(bpf: &'a mut Ebpf, name: &str) -> Result<&'a mut P, AttachError>
where
    &'a mut P: TryFrom<&'a mut Program, Error = ProgramError>,
{
    let program = bpf
        .program_mut(name)
        .ok_or_else(|| AttachError::ProgramNotFound {
            program: name.to_string(),
        })?;
    program
        .try_into()
        .map_err(|e: ProgramError| AttachError::ProgramNotFound {
            program: format!("{} ({})", name, e),
        })
}

fn attach_failed(point: ProbePoint, error: ProgramError) -> AttachError {
    AttachError::AttachFailed {
        point,
        target: TARGET_FUNCTION.to_string(),
        error: error.to_string(),
    }
}
