use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{Builder, JoinHandle},
};

use crossbeam::channel::{self, Receiver, Select, Sender, TryRecvError};
use log::{error, info, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    error::ScavengeError,
    notification::ScavengeResult,
    scavenger::{ScavengeOptions, Scavenger},
};

enum DriverCommand {
    Scavenge {
        options: ScavengeOptions,
        token: CancellationToken,
        result_tx: Sender<Result<ScavengeResult, ScavengeError>>,
    },
}

/// A scavenge started through [`ScavengeDriver::start`].
pub struct ScavengeHandle {
    token: CancellationToken,
    result_rx: Receiver<Result<ScavengeResult, ScavengeError>>,
}

impl ScavengeHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Block until the scavenge completes.
    pub fn wait(self) -> Result<ScavengeResult, ScavengeError> {
        self.result_rx.recv().map_err(|_| ScavengeError::Shutdown)?
    }
}

/// Runs scavenges on a dedicated thread, at most one at a time.
pub struct ScavengeDriver {
    tx: Sender<DriverCommand>,
    shutdown_tx: Sender<()>,
    running: Arc<AtomicBool>,
    current: Arc<Mutex<Option<CancellationToken>>>,
    handles: Vec<JoinHandle<()>>,
}

impl ScavengeDriver {
    pub fn new(scavenger: Scavenger) -> Result<Self, ScavengeError> {
        let (tx, rx) = channel::unbounded();
        let (shutdown_tx, shutdown_rx) = channel::bounded(1);
        let running = Arc::new(AtomicBool::new(false));
        let current = Arc::new(Mutex::new(None));
        let runner = ScavengeDriverRunner {
            scavenger,
            rx,
            shutdown_rx,
            running: Arc::clone(&running),
            current: Arc::clone(&current),
        };
        let handle = Builder::new()
            .name("ScavengeDriver".to_owned())
            .spawn(move || {
                runner.run();
            })
            .map_err(|e| ScavengeError::Internal(e.to_string()))?;
        info!("ScavengeDriver thread started");
        Ok(Self {
            tx,
            shutdown_tx,
            running,
            current,
            handles: vec![handle],
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start a scavenge unless one is running already.
    pub fn start(&self, options: ScavengeOptions) -> Result<ScavengeHandle, ScavengeError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ScavengeError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        *self.current.lock() = Some(token.clone());
        let (result_tx, result_rx) = channel::bounded(1);
        let command = DriverCommand::Scavenge {
            options,
            token: token.clone(),
            result_tx,
        };
        if self.tx.send(command).is_err() {
            self.current.lock().take();
            self.running.store(false, Ordering::Release);
            return Err(ScavengeError::Shutdown);
        }
        Ok(ScavengeHandle { token, result_rx })
    }

    /// Cancel the running scavenge, if any.
    pub fn stop(&self) {
        if let Some(token) = self.current.lock().as_ref() {
            info!("Stopping the running scavenge");
            token.cancel();
        }
    }

    fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("ScavengeDriver thread panicked");
            }
        }
    }
}

impl Drop for ScavengeDriver {
    fn drop(&mut self) {
        self.stop();
        if self.shutdown_tx.send(()).is_err() {
            warn!("ScavengeDriver thread has quit already");
        }
        self.join();
    }
}

struct ScavengeDriverRunner {
    scavenger: Scavenger,
    rx: Receiver<DriverCommand>,
    shutdown_rx: Receiver<()>,
    running: Arc<AtomicBool>,
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl ScavengeDriverRunner {
    fn run(&self) {
        let mut selector = Select::new();
        selector.recv(&self.rx);
        selector.recv(&self.shutdown_rx);
        loop {
            let index = selector.ready();
            if 0 == index {
                match self.rx.try_recv() {
                    Ok(DriverCommand::Scavenge {
                        options,
                        token,
                        result_tx,
                    }) => {
                        let result = self.scavenger.scavenge(&options, &token);
                        self.current.lock().take();
                        self.running.store(false, Ordering::Release);
                        if let Err(e) = &result {
                            warn!("Scavenge did not start: {}", e);
                        }
                        if result_tx.send(result).is_err() {
                            info!("Scavenge completed but nobody waits for it");
                        }
                    }
                    Err(TryRecvError::Empty) => continue,
                    Err(TryRecvError::Disconnected) => {
                        info!("ScavengeDriver command channel disconnected");
                        break;
                    }
                }
            } else if 1 == index {
                info!("Got a command to quit ScavengeDriver thread");
                break;
            }
        }
        info!("ScavengeDriver thread completed");
    }
}
