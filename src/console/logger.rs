//! Per-port console logger
//!
//! One blocking reader per logged console. It reads the host end of the
//! nmdm pair a byte at a time, appends each byte to the console log as it
//! arrives and forwards to at most one subscriber. A slow subscriber loses bytes; the log never
//! does.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nix::sys::termios::{cfsetspeed, tcgetattr, tcsetattr, BaudRate, SetArg};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::{CONSOLE_BYTES_TOTAL, CONSOLE_DROPPED_BYTES_TOTAL};
use crate::vm::handle::GuestStatus;

/// Bytes buffered for a console subscriber before output is dropped
pub const SUBSCRIBER_CAPACITY: usize = 4096;

const IDLE_SLEEP: Duration = Duration::from_millis(10);

type Subscriber = Arc<Mutex<Option<mpsc::Sender<u8>>>>;

fn slot(subscriber: &Subscriber) -> MutexGuard<'_, Option<mpsc::Sender<u8>>> {
    subscriber.lock().unwrap_or_else(|e| e.into_inner())
}

fn baud_rate(speed: u32) -> Option<BaudRate> {
    Some(match speed {
        9_600 => BaudRate::B9600,
        19_200 => BaudRate::B19200,
        38_400 => BaudRate::B38400,
        57_600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        _ => return None,
    })
}

fn set_speed(device: &File, speed: u32) -> nix::Result<()> {
    let Some(rate) = baud_rate(speed) else {
        return Err(nix::errno::Errno::EINVAL);
    };
    let mut termios = tcgetattr(device)?;
    cfsetspeed(&mut termios, rate)?;
    tcsetattr(device, SetArg::TCSANOW, &termios)
}

/// Tails one serial port
pub struct ConsoleLogger {
    port: usize,
    device: PathBuf,
    cancel: Arc<AtomicBool>,
    subscriber: Subscriber,
    task: Option<JoinHandle<()>>,
}

impl ConsoleLogger {
    /// Open `device` (the host end) and start logging to `log_path`.
    ///
    /// The reader runs until cancelled, until `status` reports STOPPED, or
    /// one read after it leaves RUNNING.
    pub fn spawn(
        port: usize,
        device: &Path,
        speed: u32,
        log_path: &Path,
        status: watch::Receiver<GuestStatus>,
    ) -> std::io::Result<Self> {
        let input = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
            .open(device)?;

        if let Err(e) = set_speed(&input, speed) {
            debug!(device = %device.display(), speed, error = %e, "could not set console speed");
        }

        if let Some(dir) = log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let log = OpenOptions::new().create(true).append(true).open(log_path)?;

        let cancel = Arc::new(AtomicBool::new(false));
        let subscriber: Subscriber = Arc::new(Mutex::new(None));

        let task = {
            let cancel = Arc::clone(&cancel);
            let subscriber = Arc::clone(&subscriber);
            let device = device.to_path_buf();
            tokio::task::spawn_blocking(move || {
                read_loop(port, input, log, status, &cancel, &subscriber);
                debug!(port, device = %device.display(), "console reader exited");
            })
        };

        info!(port, device = %device.display(), log = %log_path.display(), "console logger started");
        Ok(Self {
            port,
            device: device.to_path_buf(),
            cancel,
            subscriber,
            task: Some(task),
        })
    }

    /// Port number, starting at 1
    pub fn port(&self) -> usize {
        self.port
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Start streaming console bytes, replacing any previous subscriber
    pub fn subscribe(&self) -> mpsc::Receiver<u8> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        *slot(&self.subscriber) = Some(tx);
        rx
    }

    pub fn unsubscribe(&self) {
        slot(&self.subscriber).take();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the reader and wait for it. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        slot(&self.subscriber).take();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(port = self.port, error = %e, "console reader panicked");
            }
        }
    }
}

impl Drop for ConsoleLogger {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

fn read_loop(
    port: usize,
    mut input: impl Read,
    mut log: File,
    status: watch::Receiver<GuestStatus>,
    cancel: &AtomicBool,
    subscriber: &Subscriber,
) {
    let mut byte = [0u8; 1];
    loop {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        let current = *status.borrow();
        if current == GuestStatus::Stopped {
            break;
        }
        let draining = current != GuestStatus::Running;

        match input.read(&mut byte) {
            Ok(1) => {
                CONSOLE_BYTES_TOTAL.inc();
                if let Err(e) = log.write_all(&byte) {
                    warn!(port, error = %e, "console log write failed");
                }
                forward(subscriber, byte[0]);
            }
            Ok(_) => std::thread::sleep(IDLE_SLEEP),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                std::thread::sleep(IDLE_SLEEP)
            }
            Err(e) => {
                warn!(port, error = %e, "console read failed");
                break;
            }
        }

        if draining {
            break;
        }
    }
}

fn forward(subscriber: &Subscriber, byte: u8) {
    let mut slot = slot(subscriber);
    let Some(tx) = slot.as_ref() else {
        return;
    };
    match tx.try_send(byte) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => CONSOLE_DROPPED_BYTES_TOTAL.inc(),
        Err(mpsc::error::TrySendError::Closed(_)) => {
            slot.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Console {
        _dir: tempfile::TempDir,
        device: PathBuf,
        log: PathBuf,
    }

    fn console(contents: &[u8]) -> Console {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("nmdm0B");
        std::fs::write(&device, contents).unwrap();
        let log = dir.path().join("web").join("com1_out.log");
        Console {
            _dir: dir,
            device,
            log,
        }
    }

    async fn wait_for_log(path: &Path, expected: &[u8]) {
        for _ in 0..200 {
            if std::fs::read(path).map(|b| b == expected).unwrap_or(false) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("log never reached {:?}", String::from_utf8_lossy(expected));
    }

    #[tokio::test]
    async fn test_log_is_byte_exact_without_subscriber() {
        let c = console(b"login: \x1b[0m\r\nroot\r\n");
        let (_tx, rx) = watch::channel(GuestStatus::Running);
        let mut logger = ConsoleLogger::spawn(1, &c.device, 115_200, &c.log, rx).unwrap();

        wait_for_log(&c.log, b"login: \x1b[0m\r\nroot\r\n").await;
        logger.shutdown().await;
        assert_eq!(std::fs::read(&c.log).unwrap(), b"login: \x1b[0m\r\nroot\r\n");
    }

    #[tokio::test]
    async fn test_subscriber_receives_new_output() {
        let c = console(b"");
        let (_tx, rx) = watch::channel(GuestStatus::Running);
        let mut logger = ConsoleLogger::spawn(1, &c.device, 115_200, &c.log, rx).unwrap();
        let mut stream = logger.subscribe();

        let mut device = OpenOptions::new().append(true).open(&c.device).unwrap();
        device.write_all(b"ok").unwrap();

        let mut got = Vec::new();
        while got.len() < 2 {
            let byte = tokio::time::timeout(Duration::from_secs(2), stream.recv())
                .await
                .unwrap()
                .unwrap();
            got.push(byte);
        }
        assert_eq!(got, b"ok");

        logger.unsubscribe();
        logger.shutdown().await;
        assert!(stream.recv().await.is_none());
        assert_eq!(std::fs::read(&c.log).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_new_subscriber_replaces_old() {
        let c = console(b"");
        let (_tx, rx) = watch::channel(GuestStatus::Running);
        let mut logger = ConsoleLogger::spawn(1, &c.device, 115_200, &c.log, rx).unwrap();
        let mut first = logger.subscribe();
        let _second = logger.subscribe();
        assert!(first.recv().await.is_none());
        logger.shutdown().await;
    }

    #[tokio::test]
    async fn test_stopped_guest_ends_reader() {
        let c = console(b"ignored");
        let (_tx, rx) = watch::channel(GuestStatus::Stopped);
        let mut logger = ConsoleLogger::spawn(1, &c.device, 9_600, &c.log, rx).unwrap();
        logger.shutdown().await;
        logger.shutdown().await;
        assert!(logger.is_finished());
        assert_eq!(std::fs::read(&c.log).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_stopping_guest_drains_one_read() {
        let c = console(b"abc");
        let (_tx, rx) = watch::channel(GuestStatus::Stopping);
        let mut logger = ConsoleLogger::spawn(1, &c.device, 115_200, &c.log, rx).unwrap();
        wait_for_log(&c.log, b"a").await;
        logger.shutdown().await;
        assert_eq!(std::fs::read(&c.log).unwrap(), b"a");
    }

    #[test]
    fn test_missing_device_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = watch::channel(GuestStatus::Running);
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let result = ConsoleLogger::spawn(1, &dir.path().join("missing"), 115_200, &dir.path().join("log"), rx);
        assert!(result.is_err());
    }

    /// Never runs dry; notes how much of the log is on disk before each read
    struct Chatty {
        log: PathBuf,
        left: usize,
        cancel: Arc<AtomicBool>,
        on_disk: Vec<u64>,
    }

    impl Read for Chatty {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.on_disk
                .push(std::fs::metadata(&self.log).map(|m| m.len()).unwrap_or(0));
            if self.left == 0 {
                self.cancel.store(true, Ordering::SeqCst);
                return Err(ErrorKind::WouldBlock.into());
            }
            self.left -= 1;
            buf[0] = b'x';
            Ok(1)
        }
    }

    #[test]
    fn test_each_byte_reaches_the_log_before_the_next_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("com1_out.log");
        let log = OpenOptions::new().create(true).append(true).open(&path).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let mut input = Chatty {
            log: path.clone(),
            left: 64,
            cancel: Arc::clone(&cancel),
            on_disk: Vec::new(),
        };
        let (_tx, status) = watch::channel(GuestStatus::Running);

        read_loop(1, &mut input, log, status, &cancel, &Arc::new(Mutex::new(None)));

        assert_eq!(input.on_disk, (0..=64).collect::<Vec<u64>>());
        assert_eq!(std::fs::read(&path).unwrap(), vec![b'x'; 64]);
    }
}
