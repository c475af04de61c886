//! Background execution of long-running commands.
//!
//! Step and continue can park for an unbounded time before the stop
//! reply arrives, so they run on a dedicated worker. One persistent
//! thread consumes a one-slot mailbox; at most one command is in flight
//! per session, and the result is published through a condition variable
//! the caller polls with a timeout. The worker never holds the session
//! lock while parked: it rides the client's sliced polling, which is also
//! how it observes the interrupt event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::client::{InterruptScope, RspClient};
use crate::error::{Result, RspError};
use crate::framer::ReceiveWait;

/// Where a background command is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandScope {
    /// Fan out to every channel, accept the first stop reply, quiesce the
    /// rest.
    Broadcast,
    /// One specific channel.
    Single(usize),
}

/// What the worker produced for one background command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncOutcome {
    /// Channel the reply arrived on.
    pub channel: usize,
    /// Raw reply payload; empty when the wait was interrupted before a
    /// reply arrived.
    pub text: String,
    /// The wait ended because the session interrupt event fired.
    pub interrupted: bool,
}

struct Job {
    command: String,
    scope: CommandScope,
    /// Send the command before waiting. Cleared for "keep waiting for a
    /// stop reply" jobs where the command is already on the wire.
    send_request: bool,
    /// Park for a reply after sending.
    needs_reply: bool,
}

struct Shared {
    slot: Mutex<Option<Result<AsyncOutcome>>>,
    published: Condvar,
    in_progress: AtomicBool,
}

pub struct AsyncOrchestrator {
    client: Arc<RspClient>,
    mailbox: SyncSender<Job>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncOrchestrator {
    pub fn new(client: Arc<RspClient>) -> Result<AsyncOrchestrator> {
        let (mailbox, jobs) = sync_channel::<Job>(1);
        let shared = Arc::new(Shared {
            slot: Mutex::new(None),
            published: Condvar::new(),
            in_progress: AtomicBool::new(false),
        });
        let worker = {
            let shared = shared.clone();
            let client = client.clone();
            std::thread::Builder::new()
                .name("rsp-async".to_string())
                .spawn(move || worker_loop(jobs, client, shared))?
        };
        Ok(AsyncOrchestrator {
            client,
            mailbox,
            shared,
            worker: Some(worker),
        })
    }

    /// Queues one background command. Only one may be outstanding.
    pub fn start(
        &self,
        command: &str,
        scope: CommandScope,
        send_request: bool,
        needs_reply: bool,
    ) -> Result<()> {
        if self.shared.in_progress.swap(true, Ordering::AcqRel) {
            return Err(RspError::InvalidArgument(
                "an asynchronous command is already outstanding".to_string(),
            ));
        }
        *lock_slot(&self.shared) = None;
        let job = Job {
            command: command.to_string(),
            scope,
            send_request,
            needs_reply,
        };
        match self.mailbox.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.shared.in_progress.store(false, Ordering::Release);
                Err(RspError::InvalidArgument(
                    "asynchronous worker is unavailable".to_string(),
                ))
            }
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.shared.in_progress.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for the pending command to publish its
    /// outcome. `None` means still running.
    pub fn result(&self, timeout: Duration) -> Option<Result<AsyncOutcome>> {
        let guard = lock_slot(&self.shared);
        let (mut guard, wait) = self
            .shared
            .published
            .wait_timeout_while(guard, timeout, |slot| slot.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if wait.timed_out() && guard.is_none() {
            return None;
        }
        guard.take()
    }

    /// Breaks into a running command: interrupt bytes on every channel
    /// plus the session interrupt event. The stop reply (or the
    /// cancelled wait) surfaces through [`result`].
    pub fn interrupt(&self) {
        self.client.interrupt(InterruptScope::All);
    }
}

impl Drop for AsyncOrchestrator {
    fn drop(&mut self) {
        // Closing the mailbox ends the worker loop; a parked receive ends
        // through the interrupt event.
        if self.is_in_progress() {
            self.client.interrupt(InterruptScope::All);
        }
        let (sender, _) = sync_channel::<Job>(1);
        drop(std::mem::replace(&mut self.mailbox, sender));
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.client.clear_interrupt();
    }
}

impl std::fmt::Debug for AsyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncOrchestrator")
            .field("in_progress", &self.is_in_progress())
            .finish()
    }
}

fn lock_slot(shared: &Shared) -> std::sync::MutexGuard<'_, Option<Result<AsyncOutcome>>> {
    match shared.slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn worker_loop(jobs: Receiver<Job>, client: Arc<RspClient>, shared: Arc<Shared>) {
    while let Ok(job) = jobs.recv() {
        let outcome = run_job(&client, &job);
        let outcome = match outcome {
            Err(RspError::Cancelled) => {
                client.clear_interrupt();
                Ok(AsyncOutcome {
                    channel: client.last_active_core(),
                    text: String::new(),
                    interrupted: true,
                })
            }
            other => other,
        };
        *lock_slot(&shared) = Some(outcome);
        shared.in_progress.store(false, Ordering::Release);
        shared.published.notify_all();
    }
}

fn run_job(client: &Arc<RspClient>, job: &Job) -> Result<AsyncOutcome> {
    match job.scope {
        CommandScope::Broadcast => {
            if job.send_request {
                client.send_all(&job.command)?;
            }
            if !job.needs_reply {
                return Ok(AsyncOutcome {
                    channel: client.last_active_core(),
                    text: String::new(),
                    interrupted: false,
                });
            }
            let (channel, text) = client.receive_any(true)?;
            client.discard_pending_except(channel);
            Ok(AsyncOutcome {
                channel,
                text,
                interrupted: false,
            })
        }
        CommandScope::Single(channel) => {
            if job.send_request {
                client.send(channel, &job.command, true)?;
            }
            if !job.needs_reply {
                return Ok(AsyncOutcome {
                    channel,
                    text: String::new(),
                    interrupted: false,
                });
            }
            loop {
                if let Some(text) = client.receive(channel, ReceiveWait::Poll)? {
                    return Ok(AsyncOutcome {
                        channel,
                        text,
                        interrupted: false,
                    });
                }
            }
        }
    }
}
