//! Test doubles for the OS-facing collaborators of the guest manager

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use bhyvisor::config::{FirmwarePaths, PortRanges, ToolPaths};
use bhyvisor::exec::{CommandOutput, CommandRunner};
use bhyvisor::inventory::{NicInfo, StaticInventory};
use bhyvisor::net::{InterfaceProbe, NetworkOps};
use bhyvisor::store::{GuestStore, MemoryStore};
use bhyvisor::vm::{
    Guest, GuestManager, GuestRegistry, GuestStatus, Invocation, ManagerParts, ProcessEvent,
    ProcessSupervisor, ProcessTree, RestartPolicy, Signaller, Supervision,
};

/// Launcher pids handed out by [`FakeSupervisor`] start here
pub const FIRST_PID: u32 = 100;

/// The bhyve process sits this far above its launcher in [`FakeTree`]
pub const HYPERVISOR_PID_OFFSET: u32 = 1000;

struct Run {
    pid: u32,
    invocation: Invocation,
    events: mpsc::UnboundedSender<ProcessEvent>,
    halt: watch::Receiver<bool>,
}

/// Reports a spawn immediately and keeps the run open until told otherwise
pub struct FakeSupervisor {
    next_pid: AtomicU32,
    runs: Mutex<Vec<Run>>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(FIRST_PID),
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Make launcher `pid` exit with `code` and end its supervision
    pub fn exit(&self, pid: u32, code: Option<i32>) {
        let runs = self.runs.lock().unwrap();
        if let Some(run) = runs.iter().find(|r| r.pid == pid) {
            let _ = run.events.send(ProcessEvent::Exited { pid, code });
            let _ = run.events.send(ProcessEvent::Finished);
        }
    }

    pub fn halted(&self, pid: u32) -> bool {
        let runs = self.runs.lock().unwrap();
        runs.iter().any(|r| r.pid == pid && *r.halt.borrow())
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.runs.lock().unwrap().iter().map(|r| r.invocation.clone()).collect()
    }
}

impl ProcessSupervisor for FakeSupervisor {
    fn supervise(&self, invocation: Invocation, _policy: RestartPolicy) -> Supervision {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (tx, events) = mpsc::unbounded_channel();
        let (halt, halt_rx) = watch::channel(false);
        let _ = tx.send(ProcessEvent::Spawned { pid });
        self.runs.lock().unwrap().push(Run {
            pid,
            invocation,
            events: tx,
            halt: halt_rx,
        });
        Supervision { events, halt }
    }
}

/// Which signal a fake process gives in to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    Graceful,
    Forced,
    Never,
}

/// Every pid is alive until a signal it gives in to arrives
pub struct FakeSignaller {
    mode: KillMode,
    supervisor: Arc<FakeSupervisor>,
    dead: Mutex<HashSet<u32>>,
    pub signals: Mutex<Vec<(u32, bool)>>,
}

impl FakeSignaller {
    pub fn new(mode: KillMode, supervisor: Arc<FakeSupervisor>) -> Self {
        Self {
            mode,
            supervisor,
            dead: Mutex::new(HashSet::new()),
            signals: Mutex::new(Vec::new()),
        }
    }

    pub fn signals(&self) -> Vec<(u32, bool)> {
        self.signals.lock().unwrap().clone()
    }
}

impl Signaller for FakeSignaller {
    fn signal(&self, pid: u32, forced: bool) -> std::io::Result<()> {
        self.signals.lock().unwrap().push((pid, forced));
        let dies = match self.mode {
            KillMode::Graceful => true,
            KillMode::Forced => forced,
            KillMode::Never => false,
        };
        if dies {
            self.dead.lock().unwrap().insert(pid);
            self.supervisor.exit(pid, None);
        }
        Ok(())
    }

    fn exists(&self, pid: u32) -> bool {
        !self.dead.lock().unwrap().contains(&pid)
    }
}

/// launcher (`sudo`) -> bhyve at pid + [`HYPERVISOR_PID_OFFSET`].
///
/// Pids marked foreign belong to some unrelated `sshd` without children.
#[derive(Default)]
pub struct FakeTree {
    foreign: Mutex<HashSet<u32>>,
}

impl FakeTree {
    pub fn mark_foreign(&self, pid: u32) {
        self.foreign.lock().unwrap().insert(pid);
    }

    fn is_foreign(&self, pid: u32) -> bool {
        self.foreign.lock().unwrap().contains(&pid)
    }
}

impl ProcessTree for FakeTree {
    fn find_child(&self, pid: u32) -> Option<u32> {
        if self.is_foreign(pid) {
            return None;
        }
        (pid < HYPERVISOR_PID_OFFSET).then_some(pid + HYPERVISOR_PID_OFFSET)
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        let name = if self.is_foreign(pid) {
            "sshd"
        } else if pid < HYPERVISOR_PID_OFFSET {
            "sudo"
        } else {
            "bhyve"
        };
        Some(name.to_string())
    }
}

/// Records every command line and reports success
#[derive(Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<String>>,
}

impl RecordingRunner {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn ran(&self, command: &str) -> bool {
        self.commands().iter().any(|c| c == command)
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &Path, args: &[String]) -> std::io::Result<CommandOutput> {
        self.commands
            .lock()
            .unwrap()
            .push(format!("{} {}", program.display(), args.join(" ")));
        Ok(CommandOutput::ok(""))
    }
}

/// Records NIC operations; building can be made to fail
#[derive(Default)]
pub struct FakeNetwork {
    pub fail_build: AtomicBool,
    ops: Mutex<Vec<String>>,
}

impl FakeNetwork {
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: &str, device: &str, nic: &NicInfo) {
        self.ops
            .lock()
            .unwrap()
            .push(format!("{} {} {}", op, device, nic.switch).trim_end().to_string());
    }
}

impl NetworkOps for FakeNetwork {
    fn build(&self, device: &str, nic: &NicInfo) -> bhyvisor::Result<()> {
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(bhyvisor::Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "ifconfig: SIOCIFCREATE2: File exists",
            )));
        }
        self.record("build", device, nic);
        Ok(())
    }

    fn demolish(&self, device: &str, nic: &NicInfo) -> bhyvisor::Result<()> {
        self.record("demolish", device, nic);
        Ok(())
    }

    fn connect(&self, device: &str, nic: &NicInfo) -> bhyvisor::Result<()> {
        self.record("connect", device, nic);
        Ok(())
    }

    fn disconnect(&self, device: &str, nic: &NicInfo) -> bhyvisor::Result<()> {
        self.record("disconnect", device, nic);
        Ok(())
    }
}

pub struct FakeProbe(pub Vec<String>);

impl InterfaceProbe for FakeProbe {
    fn up_interfaces(&self) -> bhyvisor::Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// A manager wired to fakes, with a scratch state directory
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub manager: Arc<GuestManager>,
    pub registry: Arc<GuestRegistry>,
    pub inventory: Arc<StaticInventory>,
    pub supervisor: Arc<FakeSupervisor>,
    pub signaller: Arc<FakeSignaller>,
    pub runner: Arc<RecordingRunner>,
    pub network: Arc<FakeNetwork>,
    pub tree: Arc<FakeTree>,
}

impl Harness {
    pub fn new(mode: KillMode) -> Self {
        Self::with_store(mode, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(mode: KillMode, store: Arc<dyn GuestStore>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("BHYVE_UEFI_VARS.fd");
        std::fs::write(&template, b"uefi-vars-template").unwrap();

        let registry = Arc::new(GuestRegistry::load(store).unwrap());
        let inventory = Arc::new(StaticInventory::new());
        let supervisor = Arc::new(FakeSupervisor::new());
        let signaller = Arc::new(FakeSignaller::new(mode, Arc::clone(&supervisor)));
        let runner = Arc::new(RecordingRunner::default());
        let network = Arc::new(FakeNetwork::default());
        let tree = Arc::new(FakeTree::default());

        let tools = ToolPaths {
            sudo: PathBuf::new(),
            protect: PathBuf::new(),
            ..ToolPaths::default()
        };

        let manager = Arc::new(GuestManager::new(ManagerParts {
            registry: Arc::clone(&registry),
            inventory: inventory.clone(),
            network: network.clone(),
            interfaces: Arc::new(FakeProbe(vec!["lo0".to_string(), "tap0".to_string()])),
            supervisor: supervisor.clone(),
            process_tree: tree.clone(),
            signaller: signaller.clone(),
            runner: runner.clone(),
            tools,
            firmware: FirmwarePaths {
                rom: dir.path().join("BHYVE_UEFI.fd"),
                vars_template: template,
            },
            state_dir: dir.path().join("state"),
            ports: PortRanges::default(),
            reconcile_interval: Duration::from_millis(50),
        }));

        Self {
            dir,
            manager,
            registry,
            inventory,
            supervisor,
            signaller,
            runner,
            network,
            tree,
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }
}

/// Wait until `guest` reports `status`
pub async fn wait_for_status(guest: &Guest, status: GuestStatus) {
    let mut rx = guest.subscribe_status();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == status))
        .await
        .unwrap_or_else(|_| panic!("guest {} never reached {}", guest.name(), status))
        .unwrap();
}

/// Poll `cond` for up to five seconds
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
