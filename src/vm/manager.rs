//! Guest Manager - drives guests through their lifecycle
//!
//! The GuestManager is responsible for:
//! - Creating, configuring and deleting guests
//! - Validating and applying disk/ISO/NIC attachments
//! - Starting guests: ports, consoles, NIC devices, hypervisor launch
//! - Applying rctl limits once the real bhyve pid is known
//! - Stopping guests with escalating termination and a best-effort teardown
//! - Reconciling records that claim a guest is up when nothing supervises it
//!
//! ```text
//!  start ──► STARTING ──(Spawned)──► RUNNING ──stop──► STOPPING
//!     │          │                      │                  │
//!     │          └── prepare fails ─────┴── process ends ──┴──► teardown ──► STOPPED
//!     └── NotStopped unless STOPPED
//! ```
//!
//! Every run gets a run id. Teardown happens once per run id, so a stale
//! event from a previous run can never tear down the current one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::attach::{validate_attachment, AttachKind};
use super::cmdline::{build_invocation, BuiltInvocation, InvocationInput};
use super::config::{GuestConfig, COM_PORTS};
use super::handle::{Guest, GuestRuntime, GuestStatus};
use super::lifecycle::{
    prepare_uefi_vars, uefi_vars_path, CommandSupervisor, ProcessEvent, ProcessSupervisor,
    RestartPolicy, Supervision,
};
use super::ports::PortAllocator;
use super::proctree::{find_hypervisor_pid, HostProcessTree, ProcessTree};
use super::registry::GuestRegistry;
use super::terminate::{terminate, HostSignaller, Signaller, Termination};
use crate::config::{DaemonConfig, FirmwarePaths, PortRanges, ToolPaths};
use crate::console::{host_side, log_path, ConsoleLogger};
use crate::error::{EntityKind, Error, Result};
use crate::exec::{CommandRunner, SystemRunner};
use crate::inventory::Inventory;
use crate::metrics::{GUESTS_RUNNING, GUEST_STARTS_TOTAL, GUEST_STOPS_TOTAL, STOP_DURATION};
use crate::net::{HostInterfaces, IfconfigNetwork, InterfaceProbe, NetworkOps};
use crate::rctl::RctlManager;

/// Attempts to find the bhyve process under a freshly spawned launcher
const PID_LOOKUP_ATTEMPTS: u32 = 20;
const PID_LOOKUP_INTERVAL: Duration = Duration::from_millis(100);

/// Collaborators and settings a [`GuestManager`] is built from
pub struct ManagerParts {
    pub registry: Arc<GuestRegistry>,
    pub inventory: Arc<dyn Inventory>,
    pub network: Arc<dyn NetworkOps>,
    pub interfaces: Arc<dyn InterfaceProbe>,
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub process_tree: Arc<dyn ProcessTree>,
    pub signaller: Arc<dyn Signaller>,
    /// Runs rctl, renice and bhyvectl
    pub runner: Arc<dyn CommandRunner>,
    pub tools: ToolPaths,
    pub firmware: FirmwarePaths,
    pub state_dir: PathBuf,
    pub ports: PortRanges,
    pub reconcile_interval: Duration,
}

impl ManagerParts {
    /// Wire the host implementations of every OS-facing collaborator
    pub fn host(
        config: &DaemonConfig,
        registry: Arc<GuestRegistry>,
        inventory: Arc<dyn Inventory>,
    ) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let tools = config.tools.clone();
        Self {
            registry,
            inventory,
            network: Arc::new(IfconfigNetwork::new(Arc::clone(&runner), tools.clone())),
            interfaces: Arc::new(HostInterfaces),
            supervisor: Arc::new(CommandSupervisor),
            process_tree: Arc::new(HostProcessTree::new(
                Arc::clone(&runner),
                tools.pgrep.clone(),
                tools.ps.clone(),
            )),
            signaller: Arc::new(HostSignaller::new(Arc::clone(&runner), tools.clone())),
            runner,
            tools,
            firmware: config.firmware.clone(),
            state_dir: config.state_dir.clone(),
            ports: config.ports.clone(),
            reconcile_interval: Duration::from_secs(config.reconcile_interval_secs.max(1)),
        }
    }
}

/// Owns every guest operation of the daemon
pub struct GuestManager {
    registry: Arc<GuestRegistry>,
    inventory: Arc<dyn Inventory>,
    network: Arc<dyn NetworkOps>,
    interfaces: Arc<dyn InterfaceProbe>,
    supervisor: Arc<dyn ProcessSupervisor>,
    process_tree: Arc<dyn ProcessTree>,
    signaller: Arc<dyn Signaller>,
    rctl: Arc<RctlManager>,
    runner: Arc<dyn CommandRunner>,
    tools: ToolPaths,
    firmware: FirmwarePaths,
    state_dir: PathBuf,
    vnc_ports: PortAllocator,
    debug_ports: PortAllocator,
    /// Serializes attach operations so two lists can't both claim one disk
    attach_lock: tokio::sync::Mutex<()>,
    reconcile_interval: Duration,
}

impl GuestManager {
    pub fn new(parts: ManagerParts) -> Self {
        let rctl = Arc::new(RctlManager::new(Arc::clone(&parts.runner), parts.tools.clone()));
        Self {
            registry: parts.registry,
            inventory: parts.inventory,
            network: parts.network,
            interfaces: parts.interfaces,
            supervisor: parts.supervisor,
            process_tree: parts.process_tree,
            signaller: parts.signaller,
            rctl,
            runner: parts.runner,
            tools: parts.tools,
            firmware: parts.firmware,
            state_dir: parts.state_dir,
            vnc_ports: PortAllocator::new("vnc", parts.ports.vnc()),
            debug_ports: PortAllocator::new("debug", parts.ports.debug()),
            attach_lock: tokio::sync::Mutex::new(()),
            reconcile_interval: parts.reconcile_interval,
        }
    }

    pub fn registry(&self) -> &Arc<GuestRegistry> {
        &self.registry
    }

    /// Look up a guest or fail with NotFound
    pub fn guest(&self, id: &Uuid) -> Result<Arc<Guest>> {
        self.registry
            .get_by_id(id)
            .ok_or_else(|| Error::guest_not_found(id))
    }

    fn persist(&self, guest: &Guest) {
        if let Err(e) = self.registry.persist(guest) {
            warn!(guest = %guest.name(), error = %e, "failed to persist guest record");
        }
    }

    fn release_ports(&self, guest: &Guest) {
        self.vnc_ports.release(guest.id());
        self.debug_ports.release(guest.id());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Definition
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_guest(&self, name: &str, config: GuestConfig) -> Result<Arc<Guest>> {
        self.registry.create(name, config)
    }

    pub fn delete_guest(&self, id: &Uuid) -> Result<()> {
        self.registry.delete(id)?;
        self.vnc_ports.release(*id);
        self.debug_ports.release(*id);
        Ok(())
    }

    /// Replace a guest's configuration; takes effect on its next start
    pub fn update_config(&self, id: &Uuid, config: GuestConfig) -> Result<()> {
        let guest = self.guest(id)?;
        guest.transition(|state| {
            if state.deleted {
                return Err(Error::guest_not_found(id));
            }
            state.config = config;
            Ok(())
        })?;
        self.persist(&guest);
        info!(guest = %guest.name(), "configuration updated");
        Ok(())
    }

    pub async fn attach_disks(&self, id: &Uuid, disks: &[String]) -> Result<()> {
        self.attach(id, disks, AttachKind::Disk).await
    }

    pub async fn attach_isos(&self, id: &Uuid, isos: &[String]) -> Result<()> {
        self.attach(id, isos, AttachKind::Iso).await
    }

    pub async fn attach_nics(&self, id: &Uuid, nics: &[String]) -> Result<()> {
        self.attach(id, nics, AttachKind::Nic).await
    }

    /// Validate and atomically replace one attachment list
    async fn attach(&self, id: &Uuid, candidates: &[String], kind: AttachKind) -> Result<()> {
        let _serial = self.attach_lock.lock().await;
        let guest = self.guest(id)?;
        let ids = validate_attachment(
            &self.registry,
            self.inventory.as_ref(),
            candidates,
            &guest,
            kind,
        )?;

        let count = ids.len();
        guest.transition(|state| {
            if state.deleted {
                return Err(Error::guest_not_found(id));
            }
            if state.status != GuestStatus::Stopped {
                return Err(Error::NotStopped(guest.name().to_string()));
            }
            *state.attachments_mut(kind) = ids;
            Ok(())
        })?;
        self.persist(&guest);
        info!(guest = %guest.name(), kind = %kind.entity(), count, "attachments replaced");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Start
    // ─────────────────────────────────────────────────────────────────────────

    /// STOPPED -> STARTING, then launch in the background.
    ///
    /// Returns once the guest is STARTING. It becomes RUNNING when the
    /// hypervisor has been spawned, or falls back to STOPPED if launching
    /// fails.
    pub async fn start(self: &Arc<Self>, id: &Uuid) -> Result<()> {
        let guest = self.guest(id)?;
        let mut runtime = guest.runtime.lock().await;

        guest.transition(|state| {
            if state.deleted {
                return Err(Error::guest_not_found(id));
            }
            if state.status != GuestStatus::Stopped {
                return Err(Error::NotStopped(guest.name().to_string()));
            }
            let com = crate::console::resolve_com_devices(guest.name(), &state.config)?;

            let vnc_port = self.vnc_ports.reserve(guest.id())?;
            let debug_port = if state.config.debug {
                match self.debug_ports.reserve(guest.id()) {
                    Ok(port) => port,
                    Err(e) => {
                        self.vnc_ports.release(guest.id());
                        return Err(e);
                    }
                }
            } else {
                0
            };

            state.vnc_port = vnc_port;
            state.debug_port = debug_port;
            state.com = com;
            state.status = GuestStatus::Starting;
            Ok(())
        })?;

        runtime.run_id += 1;
        runtime.active = true;
        runtime.hypervisor_pid = None;
        let run_id = runtime.run_id;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        runtime.watcher_cancel = Some(cancel_tx);
        drop(runtime);

        self.persist(&guest);
        info!(guest = %guest.name(), run_id, "guest starting");

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.launch(guest, run_id, cancel_rx).await });
        Ok(())
    }

    async fn launch(self: Arc<Self>, guest: Arc<Guest>, run_id: u64, cancel: oneshot::Receiver<()>) {
        match self.prepare(&guest, run_id).await {
            Ok(events) => self.watch(guest, run_id, events, cancel).await,
            Err(e) => {
                error!(guest = %guest.name(), error = %e, "failed to start guest");
                self.finish_stop(&guest, run_id).await;
            }
        }
    }

    /// Resolve, build and hand the invocation to the supervisor
    async fn prepare(
        &self,
        guest: &Arc<Guest>,
        run_id: u64,
    ) -> Result<mpsc::UnboundedReceiver<ProcessEvent>> {
        let built = self.build(guest).await?;
        debug!(guest = %guest.name(), command = %built.invocation, "invocation built");

        for device in built.nic_devices {
            let network = Arc::clone(&self.network);
            let dev = device.clone();
            let built_ok = tokio::task::spawn_blocking(move || network.build(&dev.device, &dev.nic))
                .await
                .map_err(join_error)?;
            built_ok?;

            // recorded before connecting so teardown demolishes it either way
            guest.runtime.lock().await.nic_devices.push(device.clone());

            let network = Arc::clone(&self.network);
            tokio::task::spawn_blocking(move || network.connect(&device.device, &device.nic))
                .await
                .map_err(join_error)??;
        }

        let mut runtime = guest.runtime.lock().await;
        if !is_current(&runtime, run_id) {
            return Err(aborted(guest));
        }
        let policy = RestartPolicy::from_config(&guest.config());
        let Supervision { events, halt } = self.supervisor.supervise(built.invocation, policy);
        runtime.halt = Some(halt);
        Ok(events)
    }

    /// Blocking part of a start: inventory, host interfaces, UEFI vars
    async fn build(&self, guest: &Guest) -> Result<BuiltInvocation> {
        let inventory = Arc::clone(&self.inventory);
        let interfaces = Arc::clone(&self.interfaces);
        let tools = self.tools.clone();
        let firmware = self.firmware.clone();
        let state_dir = self.state_dir.clone();
        let name = guest.name().to_string();
        let state = guest.snapshot();

        tokio::task::spawn_blocking(move || {
            let disks = resolve(&name, EntityKind::Disk, &state.disks, |id| {
                let disk = inventory.disk(id)?;
                Ok((disk.name.clone(), disk))
            })?;
            let isos = resolve(&name, EntityKind::Iso, &state.isos, |id| {
                let iso = inventory.iso(id)?;
                Ok((iso.name.clone(), iso))
            })?;
            let nics = resolve(&name, EntityKind::Nic, &state.nics, |id| {
                let nic = inventory.nic(id)?;
                Ok((nic.name.clone(), nic))
            })?;

            let host_interfaces = interfaces.up_interfaces().unwrap_or_else(|e| {
                warn!(guest = %name, error = %e, "could not list host interfaces");
                Vec::new()
            });

            let uefi_vars = uefi_vars_path(&state_dir, &name);
            prepare_uefi_vars(&firmware.vars_template, &uefi_vars)?;

            let disks: Vec<_> = disks.into_iter().map(|(_, d)| d).collect();
            let isos: Vec<_> = isos.into_iter().map(|(_, i)| i).collect();
            let com_devices: [String; COM_PORTS] =
                std::array::from_fn(|i| state.com[i].device.clone());

            build_invocation(
                &InvocationInput {
                    name: &name,
                    config: &state.config,
                    disks: &disks,
                    isos: &isos,
                    nics: &nics,
                    vnc_port: state.vnc_port,
                    debug_port: state.debug_port,
                    com_devices: &com_devices,
                    uefi_vars: &uefi_vars,
                    firmware: &firmware.rom,
                    host_interfaces: &host_interfaces,
                },
                &tools,
            )
        })
        .await
        .map_err(join_error)?
    }

    /// Follow supervisor events until the run ends or is cancelled
    async fn watch(
        self: Arc<Self>,
        guest: Arc<Guest>,
        run_id: u64,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
        mut cancel: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut cancel => {
                    debug!(guest = %guest.name(), run_id, "event watcher cancelled");
                    return;
                }
                event = events.recv() => match event {
                    Some(ProcessEvent::Spawned { pid }) => {
                        self.on_spawned(&guest, run_id, pid).await;
                    }
                    Some(ProcessEvent::Exited { pid, code }) => {
                        info!(guest = %guest.name(), pid, ?code, "hypervisor exited");
                    }
                    Some(ProcessEvent::SpawnFailed(reason)) => {
                        error!(guest = %guest.name(), reason = %reason, "hypervisor failed to launch");
                    }
                    Some(ProcessEvent::Finished) | None => {
                        self.finish_stop(&guest, run_id).await;
                        return;
                    }
                }
            }
        }
    }

    async fn on_spawned(self: &Arc<Self>, guest: &Arc<Guest>, run_id: u64, pid: u32) {
        {
            let mut runtime = guest.runtime.lock().await;
            if !is_current(&runtime, run_id) {
                return;
            }
            if !guest.mark_running(pid) {
                debug!(guest = %guest.name(), pid, "spawn reported after the run left STARTING");
                return;
            }
            runtime.hypervisor_pid = None;
            GUEST_STARTS_TOTAL.inc();
            self.count_running();
            info!(guest = %guest.name(), pid, "guest running");
            self.persist(guest);
            self.attach_consoles(guest, &mut runtime);
        }

        let manager = Arc::clone(self);
        let guest = Arc::clone(guest);
        tokio::spawn(async move { manager.apply_limits(guest, run_id, pid).await });
    }

    /// Start a logger for every enabled, logged console that lacks one
    fn attach_consoles(&self, guest: &Guest, runtime: &mut GuestRuntime) {
        let state = guest.snapshot();
        runtime.consoles.retain(|c| !c.is_finished());

        for (index, com) in state.com.iter().enumerate() {
            let port = index + 1;
            if com.device.is_empty() || !com.logging {
                continue;
            }
            if runtime.consoles.iter().any(|c| c.port() == port) {
                continue;
            }

            let device = host_side(&com.device);
            let log = log_path(&self.state_dir, guest.name(), port);
            let speed = state.config.com[index].speed;
            match ConsoleLogger::spawn(port, Path::new(&device), speed, &log, guest.subscribe_status()) {
                Ok(logger) => {
                    guest.set_com_readable(index, true);
                    runtime.consoles.push(logger);
                }
                Err(e) => {
                    warn!(guest = %guest.name(), port, device = %device, error = %e, "console not readable");
                    guest.set_com_readable(index, false);
                }
            }
        }
    }

    /// Find the real bhyve pid under the launcher and limit it
    async fn apply_limits(self: Arc<Self>, guest: Arc<Guest>, run_id: u64, launcher: u32) {
        let binary = self.tools.hypervisor_name();
        let mut found = None;
        for _ in 0..PID_LOOKUP_ATTEMPTS {
            let tree = Arc::clone(&self.process_tree);
            let binary = binary.clone();
            found = tokio::task::spawn_blocking(move || find_hypervisor_pid(tree.as_ref(), launcher, &binary))
                .await
                .ok()
                .flatten();
            if found.is_some() || guest.status() != GuestStatus::Running {
                break;
            }
            tokio::time::sleep(PID_LOOKUP_INTERVAL).await;
        }

        let Some(pid) = found else {
            warn!(guest = %guest.name(), launcher, "hypervisor process not found, limits not applied");
            return;
        };

        {
            let mut runtime = guest.runtime.lock().await;
            if !is_current(&runtime, run_id) {
                return;
            }
            runtime.hypervisor_pid = Some(pid);
        }

        let config = guest.config();
        let rctl = Arc::clone(&self.rctl);
        let applied = tokio::task::spawn_blocking(move || {
            let rules = rctl.apply(pid, &config.limits);
            rctl.apply_priority(pid, config.priority);
            rules
        })
        .await;
        match applied {
            Ok(rules) => debug!(guest = %guest.name(), pid, rules, "limits applied"),
            Err(e) => warn!(guest = %guest.name(), pid, error = %e, "limit task failed"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stop
    // ─────────────────────────────────────────────────────────────────────────

    /// RUNNING -> STOPPING -> STOPPED.
    ///
    /// Errors only when the guest is missing or not running; once STOPPING
    /// the guest always ends STOPPED, even if the process refuses to die.
    pub async fn stop(&self, id: &Uuid) -> Result<()> {
        let guest = self.guest(id)?;
        let started = Instant::now();
        let (pid, max_wait) = guest.begin_stop()?;
        self.persist(&guest);
        info!(guest = %guest.name(), pid, "stopping guest");

        let run_id = {
            let runtime = guest.runtime.lock().await;
            if let Some(halt) = runtime.halt.as_ref() {
                halt.send_replace(true);
            }
            runtime.run_id
        };

        let outcome = terminate(Arc::clone(&self.signaller), pid, max_wait).await;
        if outcome == Termination::Refused {
            error!(guest = %guest.name(), pid, "forcing guest to STOPPED with its process alive");
        }

        if !self.finish_stop(&guest, run_id).await && guest.status() != GuestStatus::Stopped {
            // nothing supervised this run; clear the record directly
            guest.mark_stopped();
            self.release_ports(&guest);
            self.persist(&guest);
            self.count_running();
        }

        STOP_DURATION.observe(started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Tear down run `run_id` and mark the guest STOPPED.
    ///
    /// Returns false if that run was already torn down or superseded.
    async fn finish_stop(&self, guest: &Guest, run_id: u64) -> bool {
        let mut runtime = guest.runtime.lock().await;
        if !is_current(&runtime, run_id) {
            return false;
        }
        runtime.active = false;

        if let Some(halt) = runtime.halt.take() {
            halt.send_replace(true);
        }
        if let Some(cancel) = runtime.watcher_cancel.take() {
            let _ = cancel.send(());
        }

        join_all(runtime.consoles.iter_mut().map(ConsoleLogger::shutdown)).await;
        runtime.consoles.clear();

        let nic_devices = std::mem::take(&mut runtime.nic_devices);
        let hypervisor_pid = runtime.hypervisor_pid.take();
        let config = guest.config();
        let name = guest.name().to_string();
        let network = Arc::clone(&self.network);
        let rctl = Arc::clone(&self.rctl);
        let runner = Arc::clone(&self.runner);
        let tools = self.tools.clone();
        let uefi_vars = uefi_vars_path(&self.state_dir, &name);

        let teardown = tokio::task::spawn_blocking(move || {
            for dev in &nic_devices {
                if let Err(e) = network.disconnect(&dev.device, &dev.nic) {
                    warn!(guest = %name, device = %dev.device, error = %e, "failed to disconnect NIC");
                }
                if let Err(e) = network.demolish(&dev.device, &dev.nic) {
                    warn!(guest = %name, device = %dev.device, error = %e, "failed to destroy NIC device");
                }
            }

            if let Some(pid) = hypervisor_pid {
                rctl.clear(pid);
            }

            let (program, args) = tools.privileged(
                &tools.bhyvectl,
                vec!["--destroy".to_string(), format!("--vm={}", name)],
            );
            match runner.run(&program, &args) {
                Ok(output) if output.success() => debug!(guest = %name, "vm instance destroyed"),
                Ok(output) => debug!(guest = %name, stderr = %output.stderr.trim(), "bhyvectl --destroy failed"),
                Err(e) => warn!(guest = %name, error = %e, "could not run bhyvectl"),
            }

            if !config.store_uefi_vars {
                match std::fs::remove_file(&uefi_vars) {
                    Ok(()) => debug!(guest = %name, "UEFI vars discarded"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(guest = %name, error = %e, "failed to remove UEFI vars"),
                }
            }
        })
        .await;
        if let Err(e) = teardown {
            warn!(guest = %guest.name(), error = %e, "teardown task failed");
        }

        let previous = guest.mark_stopped();
        self.release_ports(guest);
        drop(runtime);

        self.persist(guest);
        GUEST_STOPS_TOTAL.inc();
        self.count_running();
        info!(guest = %guest.name(), run_id, previous = %previous, "guest stopped");
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Housekeeping
    // ─────────────────────────────────────────────────────────────────────────

    /// Force guests nothing supervises back to STOPPED.
    ///
    /// Returns how many guests were corrected.
    pub async fn reconcile(&self) -> usize {
        let mut corrected = 0;
        for guest in self.registry.get_all() {
            if guest.status() == GuestStatus::Stopped {
                continue;
            }

            let runtime = guest.runtime.lock().await;
            if runtime.active {
                continue;
            }

            let pid = guest.snapshot().bhyve_pid;
            if pid != 0 && self.signaller.exists(pid) {
                self.kill_leftover(&guest, pid).await;
            }

            let previous = guest.mark_stopped();
            self.release_ports(&guest);
            drop(runtime);
            self.persist(&guest);
            corrected += 1;
            warn!(guest = %guest.name(), previous = %previous, "reconciled unsupervised guest to STOPPED");
        }
        self.count_running();
        corrected
    }

    fn count_running(&self) {
        let running = self
            .registry
            .get_all()
            .iter()
            .filter(|g| g.status() == GuestStatus::Running)
            .count();
        GUESTS_RUNNING.set(running as i64);
    }

    /// Force-kill the hypervisor a stale record points at.
    ///
    /// The recorded pid may have been reused since; only a pid that is, or
    /// leads down to, a process named like the hypervisor is signalled.
    async fn kill_leftover(&self, guest: &Guest, recorded: u32) {
        let tree = Arc::clone(&self.process_tree);
        let binary = self.tools.hypervisor_name();
        let found = tokio::task::spawn_blocking(move || find_hypervisor_pid(tree.as_ref(), recorded, &binary))
            .await
            .ok()
            .flatten();
        let Some(pid) = found else {
            warn!(guest = %guest.name(), pid = recorded, "recorded pid is no longer a hypervisor, leaving it alone");
            return;
        };

        warn!(guest = %guest.name(), pid, "killing unsupervised hypervisor");
        let signaller = Arc::clone(&self.signaller);
        let killed = tokio::task::spawn_blocking(move || signaller.signal(pid, true)).await;
        if let Ok(Err(e)) = killed {
            warn!(guest = %guest.name(), pid, error = %e, "forced kill failed");
        }
    }

    /// Run [`reconcile`](Self::reconcile) on the configured interval
    pub fn spawn_reconciler(manager: Arc<GuestManager>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.reconcile_interval);
            loop {
                interval.tick().await;
                let corrected = manager.reconcile().await;
                if corrected > 0 {
                    info!(corrected, "reconciliation pass corrected guests");
                }
            }
        })
    }

    /// Start every autostart guest in name order, honoring each delay
    pub fn autostart(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            for guest in manager.registry.get_all() {
                let config = guest.config();
                if !config.autostart {
                    continue;
                }
                if !config.autostart_delay().is_zero() {
                    tokio::time::sleep(config.autostart_delay()).await;
                }
                match manager.start(&guest.id()).await {
                    Ok(()) => info!(guest = %guest.name(), "autostarted"),
                    Err(e) => warn!(guest = %guest.name(), error = %e, "autostart failed"),
                }
            }
        })
    }

    /// Stop every running guest concurrently; used on daemon exit
    pub async fn shutdown(&self) {
        let running: Vec<Arc<Guest>> = self
            .registry
            .get_all()
            .into_iter()
            .filter(|g| g.status() == GuestStatus::Running)
            .collect();
        info!(count = running.len(), "stopping all guests");

        let stops = running.iter().map(|guest| async move {
            if let Err(e) = self.stop(&guest.id()).await {
                warn!(guest = %guest.name(), error = %e, "stop during shutdown failed");
            }
        });
        join_all(stops).await;
        info!("all guests stopped");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn subscribe_status(&self, id: &Uuid) -> Result<watch::Receiver<GuestStatus>> {
        Ok(self.guest(id)?.subscribe_status())
    }

    /// Stream console `port` (1-based) of a running guest.
    ///
    /// Replaces any earlier subscriber of that console.
    pub async fn subscribe_console(&self, id: &Uuid, port: usize) -> Result<mpsc::Receiver<u8>> {
        let guest = self.guest(id)?;
        if guest.status() != GuestStatus::Running {
            return Err(Error::NotRunning(guest.name().to_string()));
        }
        let runtime = guest.runtime.lock().await;
        runtime
            .consoles
            .iter()
            .find(|c| c.port() == port)
            .map(ConsoleLogger::subscribe)
            .ok_or_else(|| Error::InvalidComDevice {
                port,
                device: String::new(),
                reason: "console is not being logged".to_string(),
            })
    }

    pub async fn unsubscribe_console(&self, id: &Uuid, port: usize) -> Result<()> {
        let guest = self.guest(id)?;
        let runtime = guest.runtime.lock().await;
        if let Some(console) = runtime.consoles.iter().find(|c| c.port() == port) {
            console.unsubscribe();
        }
        Ok(())
    }
}

fn is_current(runtime: &GuestRuntime, run_id: u64) -> bool {
    runtime.active && runtime.run_id == run_id
}

fn aborted(guest: &Guest) -> Error {
    Error::NotRunning(guest.name().to_string())
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

/// Look up every id; entities that no longer exist are skipped
fn resolve<T>(
    guest: &str,
    kind: EntityKind,
    ids: &[Uuid],
    lookup: impl Fn(&Uuid) -> Result<(String, T)>,
) -> Result<Vec<(Uuid, T)>> {
    let mut found = Vec::with_capacity(ids.len());
    for id in ids {
        let (name, entity) = lookup(id)?;
        if name.is_empty() {
            warn!(guest = %guest, kind = %kind, id = %id, "attached entity no longer exists, skipping");
            continue;
        }
        found.push((*id, entity));
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::inventory::StaticInventory;
    use crate::store::MemoryStore;
    use crate::vm::cmdline::Invocation;

    struct Quiet;

    impl CommandRunner for Quiet {
        fn run(&self, _: &Path, _: &[String]) -> std::io::Result<CommandOutput> {
            Ok(CommandOutput::ok(""))
        }
    }

    impl ProcessTree for Quiet {
        fn find_child(&self, _: u32) -> Option<u32> {
            None
        }
        fn process_name(&self, _: u32) -> Option<String> {
            None
        }
    }

    impl Signaller for Quiet {
        fn signal(&self, _: u32, _: bool) -> std::io::Result<()> {
            Ok(())
        }
        fn exists(&self, _: u32) -> bool {
            false
        }
    }

    impl InterfaceProbe for Quiet {
        fn up_interfaces(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    impl NetworkOps for Quiet {
        fn build(&self, _: &str, _: &crate::inventory::NicInfo) -> Result<()> {
            Ok(())
        }
        fn demolish(&self, _: &str, _: &crate::inventory::NicInfo) -> Result<()> {
            Ok(())
        }
        fn connect(&self, _: &str, _: &crate::inventory::NicInfo) -> Result<()> {
            Ok(())
        }
        fn disconnect(&self, _: &str, _: &crate::inventory::NicInfo) -> Result<()> {
            Ok(())
        }
    }

    impl ProcessSupervisor for Quiet {
        fn supervise(&self, _: Invocation, _: RestartPolicy) -> Supervision {
            let (_tx, events) = mpsc::unbounded_channel();
            let (halt, _) = watch::channel(false);
            Supervision { events, halt }
        }
    }

    fn manager(ports: PortRanges) -> Arc<GuestManager> {
        let quiet = Arc::new(Quiet);
        Arc::new(GuestManager::new(ManagerParts {
            registry: Arc::new(GuestRegistry::new(Arc::new(MemoryStore::new()))),
            inventory: Arc::new(StaticInventory::new()),
            network: quiet.clone(),
            interfaces: quiet.clone(),
            supervisor: quiet.clone(),
            process_tree: quiet.clone(),
            signaller: quiet.clone(),
            runner: quiet,
            tools: ToolPaths::default(),
            firmware: FirmwarePaths::default(),
            state_dir: PathBuf::from("/nonexistent"),
            ports,
            reconcile_interval: Duration::from_secs(1),
        }))
    }

    #[tokio::test]
    async fn test_exhausted_debug_ports_leave_guest_stopped() {
        let ports = PortRanges {
            debug_first: 2828,
            debug_last: 2828,
            ..PortRanges::default()
        };
        let manager = manager(ports);
        let mut config = GuestConfig::default();
        config.debug = true;
        let a = manager.create_guest("a", config.clone()).unwrap();
        let b = manager.create_guest("b", config).unwrap();

        // `a` holds the only debug port
        manager.debug_ports.reserve(a.id()).unwrap();
        let err = manager.start(&b.id()).await.unwrap_err();
        assert!(matches!(err, Error::PortsExhausted("debug")));
        assert_eq!(b.status(), GuestStatus::Stopped);
        assert_eq!(manager.vnc_ports.in_use(), Vec::<u16>::new());
    }

    #[tokio::test]
    async fn test_invalid_console_rejected_before_any_reservation() {
        let manager = manager(PortRanges::default());
        let mut config = GuestConfig::default();
        config.com[0].device = "/dev/nmdm0B".to_string();
        let guest = manager.create_guest("web", config).unwrap();

        let err = manager.start(&guest.id()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidComDevice { port: 1, .. }));
        assert_eq!(guest.status(), GuestStatus::Stopped);
        assert!(manager.vnc_ports.in_use().is_empty());
    }

    #[tokio::test]
    async fn test_failed_launch_returns_to_stopped() {
        let manager = manager(PortRanges::default());
        let guest = manager.create_guest("web", GuestConfig::default()).unwrap();
        let mut status = guest.subscribe_status();

        manager.start(&guest.id()).await.unwrap();
        // the UEFI vars template does not exist, so the launch task fails
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == GuestStatus::Stopped))
            .await
            .unwrap()
            .unwrap();

        let state = guest.snapshot();
        assert_eq!((state.bhyve_pid, state.vnc_port), (0, 0));
        assert!(manager.vnc_ports.in_use().is_empty());
    }

    #[tokio::test]
    async fn test_update_config_persists() {
        let manager = manager(PortRanges::default());
        let guest = manager.create_guest("web", GuestConfig::default()).unwrap();
        let mut config = GuestConfig::default();
        config.cpu = 4;
        manager.update_config(&guest.id(), config).unwrap();
        assert_eq!(guest.config().cpu, 4);
        assert!(manager.update_config(&Uuid::now_v7(), GuestConfig::default()).is_err());
    }
}
