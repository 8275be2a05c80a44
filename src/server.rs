use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::bench::BenchmarkLog;
use crate::channel::{ChannelRegistry, Transaction};
use crate::ctap2::{Authenticator, PresenceCheck};
use crate::dispatch::{init_response_payload, FrameSink, HidCommand, HidError, KeepAlive};
use crate::hal::{HidEndpoint, PresenceButton, StatusLed};
use crate::presence::PresenceGate;
use crate::wire::{self, CID_BROADCAST, REPORT_SIZE};

/// Main-loop tick: bounds how late a transaction-timeout sweep can run.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Back-off before the reader thread attempts to reopen a failed endpoint.
const REOPEN_BACKOFF: Duration = Duration::from_secs(1);

struct InFlight {
    channel: u32,
    cancelled: Arc<AtomicBool>,
}

/// One command's presence hook: the gate plus this command's cancel flag and
/// keep-alive status byte.
struct PresenceSession {
    gate: Arc<PresenceGate>,
    cancelled: Arc<AtomicBool>,
    status: Arc<AtomicU8>,
}

impl PresenceCheck for PresenceSession {
    fn request(&self) -> bool {
        self.gate.wait(&self.cancelled, &self.status)
    }
}

/// Ties the transport to the authenticator: one reader thread feeding raw
/// reports into a queue, the main loop assembling transactions and answering
/// control commands inline, and a short-lived worker thread per CBOR command
/// owning keep-alive, presence and the response burst.
pub struct Server {
    endpoint: Arc<dyn HidEndpoint>,
    sink: Arc<FrameSink>,
    gate: Arc<PresenceGate>,
    registry: ChannelRegistry,
    auth: Arc<Mutex<Authenticator>>,
    bench: Option<Arc<Mutex<BenchmarkLog>>>,
    in_flight: Arc<Mutex<Option<InFlight>>>,
}

impl Server {
    pub fn new(
        endpoint: Arc<dyn HidEndpoint>,
        button: Arc<dyn PresenceButton>,
        led: Arc<dyn StatusLed>,
        auth: Authenticator,
        bench: Option<BenchmarkLog>,
    ) -> Self {
        let sink = Arc::new(FrameSink::new(endpoint.clone(), led));
        Server {
            endpoint,
            sink,
            gate: Arc::new(PresenceGate::new(button)),
            registry: ChannelRegistry::new(),
            auth: Arc::new(Mutex::new(auth)),
            bench: bench.map(|b| Arc::new(Mutex::new(b))),
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    #[cfg(test)]
    pub(crate) fn authenticator(&self) -> Arc<Mutex<Authenticator>> {
        self.auth.clone()
    }

    /// Run until the endpoint is gone for good.
    pub fn run(&mut self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let reader = {
            let endpoint = self.endpoint.clone();
            std::thread::spawn(move || reader_loop(endpoint, tx))
        };

        log::info!("authenticator ready");
        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(report) => self.handle_report(report),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            for channel in self.registry.sweep_expired(Instant::now()) {
                self.sink.send_error(channel, HidError::MsgTimeout);
            }
        }

        let _ = reader.join();
        log::info!("HID endpoint closed, shutting down");
        Ok(())
    }

    fn handle_report(&mut self, report: [u8; REPORT_SIZE]) {
        let mut report = report;
        if report[..4] == [0, 0, 0, 0] {
            // Transport stripped the leading channel bytes; realign once.
            report = wire::realign_report(&report);
            if report[..4] == [0, 0, 0, 0] {
                log::warn!("dropping report with zero channel after re-alignment");
                return;
            }
        }

        let frame = wire::parse_report(&report);
        let channel = frame.channel();
        match self.registry.ingest(frame) {
            Ok(Some(txn)) => self.handle_transaction(txn),
            Ok(None) => {}
            Err(err) => self.sink.send_error(channel, err.into()),
        }
    }

    fn handle_transaction(&mut self, txn: Transaction) {
        let Ok(cmd) = HidCommand::try_from(txn.cmd) else {
            self.sink.send_error(txn.channel, HidError::InvalidCmd);
            return;
        };
        log::debug!(
            "transaction {:?} on channel 0x{:08X}, {} byte(s)",
            cmd,
            txn.channel,
            txn.payload.len()
        );

        // CANCEL is the only traffic a busy authenticator acts on.
        if cmd == HidCommand::Cancel {
            self.handle_cancel(&txn);
            return;
        }
        if self.in_flight.lock().unwrap().is_some() {
            self.sink.send_error(txn.channel, HidError::ChannelBusy);
            return;
        }

        match cmd {
            HidCommand::Init => {
                let (new_channel, respond_on) = if txn.channel == CID_BROADCAST {
                    (self.registry.allocate(), CID_BROADCAST)
                } else {
                    self.registry.reset(txn.channel);
                    (txn.channel, txn.channel)
                };
                self.send_or_log(
                    respond_on,
                    HidCommand::Init,
                    &init_response_payload(&txn.payload, new_channel),
                );
            }
            HidCommand::Ping => self.send_or_log(txn.channel, HidCommand::Ping, &txn.payload),
            HidCommand::Wink => {
                self.sink.wink();
                self.send_or_log(txn.channel, HidCommand::Wink, &[]);
            }
            HidCommand::Cbor => self.spawn_cbor_worker(txn),
            // Outbound-only commands are not valid requests.
            HidCommand::Keepalive | HidCommand::Error => {
                self.sink.send_error(txn.channel, HidError::InvalidCmd)
            }
            HidCommand::Cancel => unreachable!("handled above"),
        }
    }

    fn handle_cancel(&mut self, txn: &Transaction) {
        let in_flight = self.in_flight.lock().unwrap();
        match in_flight.as_ref() {
            Some(flight) if flight.channel == txn.channel => {
                log::info!("cancelling command on channel 0x{:08X}", txn.channel);
                // The aborted command answers the transaction with 0x2D;
                // no separate CANCEL response frame.
                flight.cancelled.store(true, Ordering::SeqCst);
            }
            _ => {
                drop(in_flight);
                self.send_or_log(txn.channel, HidCommand::Cancel, &[]);
            }
        }
    }

    fn spawn_cbor_worker(&mut self, txn: Transaction) {
        let cancelled = Arc::new(AtomicBool::new(false));
        *self.in_flight.lock().unwrap() = Some(InFlight {
            channel: txn.channel,
            cancelled: cancelled.clone(),
        });

        let sink = self.sink.clone();
        let auth = self.auth.clone();
        let gate = self.gate.clone();
        let bench = self.bench.clone();
        let in_flight = self.in_flight.clone();

        std::thread::spawn(move || {
            let keepalive = KeepAlive::start(sink.clone(), txn.channel);
            let session = PresenceSession {
                gate,
                cancelled,
                status: keepalive.status_handle(),
            };

            let started = Instant::now();
            let reply = auth.lock().unwrap().handle_cbor(&txn.payload, &session);
            let elapsed = started.elapsed();

            // No keep-alive may interleave with the response burst.
            keepalive.stop();
            if let Err(e) = sink.send_message(txn.channel, HidCommand::Cbor, &reply) {
                log::error!("failed to send CBOR response: {:#}", e);
            }

            if let Some(bench) = bench {
                let last_algo = auth.lock().unwrap().last_algo();
                if let Err(e) = bench.lock().unwrap().append(
                    HidCommand::Cbor.into(),
                    &txn.payload,
                    HidCommand::Cbor.into(),
                    &reply,
                    last_algo,
                    elapsed,
                ) {
                    log::error!("benchmark write failed: {:#}", e);
                }
            }

            *in_flight.lock().unwrap() = None;
        });
    }

    fn send_or_log(&self, channel: u32, cmd: HidCommand, payload: &[u8]) {
        if let Err(e) = self.sink.send_message(channel, cmd, payload) {
            log::error!("failed to send {:?} response: {:#}", cmd, e);
        }
    }
}

fn reader_loop(endpoint: Arc<dyn HidEndpoint>, tx: Sender<[u8; REPORT_SIZE]>) {
    loop {
        match endpoint.read_report() {
            Ok(report) => {
                if tx.send(report).is_err() {
                    return;
                }
            }
            Err(e) => {
                log::error!("HID read failed: {:#}", e);
                std::thread::sleep(REOPEN_BACKOFF);
                if let Err(e) = endpoint.reopen() {
                    log::error!("HID endpoint lost: {:#}", e);
                    return;
                }
            }
        }
    }
}
