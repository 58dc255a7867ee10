//! Network workers: a producer/reflector pair implementing a page round
//! trip over a TCP socket. Useful mostly for data-path sanity.
//!
//! The master sends a valid page to a remote reflector and verifies what
//! comes back; the listener accepts connections and spawns reflector
//! threads that echo pages until the peer hangs up. Reflectors run on
//! no-pause semantics: they must keep draining the socket even during
//! synchronized pauses.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use crate::pool::DONT_CARE_TAG;
use crate::util::current_cpu;
use crate::worker::{WorkerBase, WorkerKind, WorkerOutcome, WorkerTask};

/// Fixed port of the page-reflection protocol.
pub const NETWORK_PORT: u16 = 19996;

/// Seconds the master waits for the remote reflector to come up.
const CONNECT_DELAY: u64 = 15;

/// Socket receive timeout, so a stop is observed on an idle connection.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct NetworkThread {
    base: WorkerBase,
    ipaddr: String,
}

impl NetworkThread {
    pub fn new(base: WorkerBase, ipaddr: String) -> Self {
        Self { base, ipaddr }
    }

    fn send_page(&mut self, stream: &mut TcpStream, bytes: &[u8]) -> bool {
        match stream.write_all(bytes) {
            Ok(()) => true,
            Err(e) => {
                if self.base.is_ready_to_run_no_pause() {
                    self.base
                        .step
                        .add_process_error(&format!("network write failed: {e}"));
                    self.base.ok = false;
                }
                false
            }
        }
    }

    fn receive_page(&mut self, stream: &mut TcpStream, bytes: &mut [u8]) -> bool {
        match stream.read_exact(bytes) {
            Ok(()) => true,
            Err(e) => {
                if self.base.is_ready_to_run_no_pause() {
                    self.base
                        .step
                        .add_process_error(&format!("network read failed: {e}"));
                    self.base.ok = false;
                } else {
                    // The two ends never stop in perfect sync; a short
                    // read at shutdown is expected.
                    self.base
                        .step
                        .log_info("net thread did not receive any data, exiting");
                }
                false
            }
        }
    }
}

impl WorkerTask for NetworkThread {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Net
    }

    fn work(&mut self) -> WorkerOutcome {
        self.base.pin();
        self.base.start_timer();
        self.base
            .step
            .log_debug(&format!("starting network thread on ip {}", self.ipaddr));

        // Give the remote reflector time to start listening.
        for _ in 0..CONNECT_DELAY {
            if !self.base.is_ready_to_run_no_pause() {
                self.base.finish_early_if_running();
                self.base.stop_timer();
                return self.base.outcome(WorkerKind::Net, 0, 0);
            }
            std::thread::sleep(Duration::from_secs(1));
        }

        let mut stream = match TcpStream::connect((self.ipaddr.as_str(), NETWORK_PORT)) {
            Ok(s) => s,
            Err(e) => {
                self.base
                    .step
                    .add_process_error(&format!("cannot connect to {}: {e}", self.ipaddr));
                self.base.ok = false;
                self.base.finish_early_if_running();
                self.base.stop_timer();
                return self.base.outcome(WorkerKind::Net, 0, 0);
            }
        };
        let _ = stream.set_read_timeout(Some(RECV_TIMEOUT));

        let pool = self.base.env.pool.clone();
        let page_length = self.base.env.page_length;
        let mut loops = 0u64;
        while self.base.is_ready_to_run() {
            let Some(mut src) = pool.get_valid(DONT_CARE_TAG) else {
                continue;
            };
            let Some(mut dst) = pool.get_empty(DONT_CARE_TAG) else {
                pool.put_valid(src);
                continue;
            };

            self.base.crc_check_page(&src);

            let src_bytes = unsafe {
                self.base
                    .env
                    .region
                    .page_bytes(src.desc.offset, page_length)
            };
            let dst_bytes = unsafe {
                self.base
                    .env
                    .region
                    .page_bytes(dst.desc.offset, page_length)
            };

            let sent = self.send_page(&mut stream, src_bytes);
            dst.desc.pattern = src.desc.pattern;
            dst.desc.last_cpu = current_cpu();
            let received = sent && self.receive_page(&mut stream, dst_bytes);
            if received {
                self.base.crc_check_page(&dst);
            }

            // Return all of our pages to the pool; the destination now
            // carries the pattern, the source is recycled as empty.
            if received {
                pool.put_valid(dst);
                pool.put_empty(src);
            } else {
                dst.desc.pattern = None;
                pool.put_empty(dst);
                pool.put_valid(src);
                break;
            }
            loops += 1;
        }

        self.base.pages_copied = loops;
        self.base.finish_early_if_running();
        self.base.stop_timer();
        self.base.step.log_debug(&format!(
            "network thread completed, status {}, {loops} pages copied",
            self.base.ok
        ));
        let device_bytes = loops * 2 * page_length as u64;
        self.base.outcome(WorkerKind::Net, 0, device_bytes)
    }
}

/// Accepts reflector connections and spawns one echo thread per peer.
pub struct NetworkListenThread {
    base: WorkerBase,
}

impl NetworkListenThread {
    pub fn new(base: WorkerBase) -> Self {
        Self { base }
    }
}

impl WorkerTask for NetworkListenThread {
    fn kind(&self) -> WorkerKind {
        WorkerKind::NetListen
    }

    fn work(&mut self) -> WorkerOutcome {
        self.base.start_timer();
        self.base.step.log_debug("starting network listen thread");

        let listener = match TcpListener::bind(("0.0.0.0", NETWORK_PORT)) {
            Ok(l) => l,
            Err(e) => {
                self.base
                    .step
                    .add_process_error(&format!("cannot bind socket: {e}"));
                self.base.ok = false;
                self.base.finish_early_if_running();
                self.base.stop_timer();
                return self.base.outcome(WorkerKind::NetListen, 0, 0);
            }
        };
        if let Err(e) = listener.set_nonblocking(true) {
            self.base
                .step
                .add_process_error(&format!("cannot configure socket: {e}"));
            self.base.ok = false;
            self.base.finish_early_if_running();
            self.base.stop_timer();
            return self.base.outcome(WorkerKind::NetListen, 0, 0);
        }

        let page_length = self.base.env.page_length;
        let step = self.base.step.clone();
        let mut slaves = Vec::new();
        while self.base.is_ready_to_run() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    step.log_debug(&format!("spawning reflector for {peer}"));
                    let step = step.clone();
                    slaves.push(std::thread::spawn(move || {
                        reflect_pages(stream, page_length, &step)
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    step.log_warn(&format!("accept failed: {e}"));
                }
            }
        }

        // Reflectors exit when their peers hang up.
        let mut reflected = 0u64;
        for slave in slaves {
            if let Ok(pages) = slave.join() {
                reflected += pages;
            }
        }
        self.base.pages_copied = reflected;
        self.base.finish_early_if_running();
        self.base.stop_timer();
        self.base.step.log_debug(&format!(
            "network listen thread completed, {reflected} pages reflected"
        ));
        let device_bytes = reflected * 2 * page_length as u64;
        self.base.outcome(WorkerKind::NetListen, 0, device_bytes)
    }
}

/// Echo whole pages back to the peer until the connection drops.
fn reflect_pages(
    mut stream: TcpStream,
    page_length: usize,
    step: &crate::report::TestStep,
) -> u64 {
    let mut buf = vec![0u8; page_length];
    let mut loops = 0u64;
    loop {
        if stream.read_exact(&mut buf).is_err() {
            break;
        }
        if stream.write_all(&buf).is_err() {
            break;
        }
        loops += 1;
    }
    step.log_debug(&format!("reflector finished, {loops} pages reflected"));
    loops
}
