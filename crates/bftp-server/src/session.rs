//! Per-connection session state machine.
//!
//! One `Session` per TCP connection, owned exclusively by that connection's
//! task. It interprets decoded packets against the current state (login
//! status, in-flight transfer), drives the stop-and-wait block loop, and
//! talks to the rest of the server only through the registry (sends,
//! broadcasts, namespace gate) and the file store.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::mem;
use std::sync::Arc;

use bftp_store::{FileStore, StoreError};
use bftp_wire::{ErrorCode, Packet, BLOCK_SIZE};
use tracing::{debug, info, warn};

use crate::registry::{ConnectionId, Registry};

/// In-flight transfer context. Exists iff a transfer is in progress.
enum Transfer {
    Idle,
    /// RRQ or DIRQ: blocks already built, sent one at a time as the peer
    /// acknowledges. `expected_ack` is the block number of the last block
    /// sent.
    Sending {
        queue: VecDeque<Packet>,
        expected_ack: u16,
    },
    /// WRQ: open sink plus the block number the peer must send next. The
    /// filename stays reserved in the registry until the final block lands.
    Receiving {
        filename: String,
        sink: File,
        next_block: u16,
    },
}

pub struct Session {
    id: ConnectionId,
    registry: Arc<Registry>,
    store: Arc<FileStore>,
    username: Option<String>,
    transfer: Transfer,
    terminate: bool,
}

impl Session {
    pub fn new(id: ConnectionId, registry: Arc<Registry>, store: Arc<FileStore>) -> Self {
        Self {
            id,
            registry,
            store,
            username: None,
            transfer: Transfer::Idle,
            terminate: false,
        }
    }

    /// Checked by the connection task after every processed packet.
    pub fn should_terminate(&self) -> bool {
        self.terminate
    }

    /// Interpret one decoded packet.
    pub async fn process(&mut self, packet: Packet) {
        // Everything except LOGRQ requires a login; DISC works in any state.
        if self.username.is_none() && !matches!(packet, Packet::Logrq { .. } | Packet::Disc) {
            self.send_error(ErrorCode::NotLoggedIn, "not logged in");
            return;
        }
        // Stop-and-wait: a new request cannot start while a transfer is in
        // flight on this connection.
        if !matches!(self.transfer, Transfer::Idle)
            && matches!(
                packet,
                Packet::Rrq { .. } | Packet::Wrq { .. } | Packet::Dirq | Packet::Delrq { .. }
            )
        {
            self.send_error(ErrorCode::NotDefined, "another transfer is in progress");
            return;
        }

        match packet {
            Packet::Logrq { username } => self.handle_login(username),
            Packet::Dirq => self.handle_dir_list().await,
            Packet::Rrq { filename } => self.handle_read(filename).await,
            Packet::Wrq { filename } => self.handle_write(filename).await,
            Packet::Data { block, payload } => self.handle_data(block, payload).await,
            Packet::Ack { block } => self.handle_ack(block),
            Packet::Delrq { filename } => self.handle_delete(filename).await,
            Packet::Error { code, message } => self.handle_peer_error(code, message).await,
            Packet::Bcast { .. } => {
                self.send_error(ErrorCode::IllegalOperation, "BCAST is server-to-client only")
            }
            Packet::Disc => self.handle_disconnect().await,
        }
    }

    /// Cleanup for an abruptly closed connection: roll back a partial
    /// upload and free the username. The handler unregisters afterwards.
    pub async fn close(&mut self) {
        let transfer = mem::replace(&mut self.transfer, Transfer::Idle);
        if let Transfer::Receiving { filename, sink, .. } = transfer {
            drop(sink);
            self.abort_write(&filename).await;
        }
        if let Some(name) = self.username.take() {
            self.registry.logout(&name);
            debug!(connection = self.id, user = %name, "logged out on close");
        }
    }

    fn handle_login(&mut self, username: String) {
        if self.username.is_some() {
            self.send_error(ErrorCode::AlreadyLoggedIn, "already logged in");
            return;
        }
        if !self.registry.login(&username, self.id) {
            self.send_error(ErrorCode::NotDefined, "username already in use");
            return;
        }
        info!(connection = self.id, user = %username, "logged in");
        self.username = Some(username);
        self.send(Packet::Ack { block: 0 });
    }

    async fn handle_dir_list(&mut self) {
        let store = Arc::clone(&self.store);
        let listing = self.registry.with_read_access(|| store.list()).await;
        match listing {
            Ok(names) => {
                // Each name followed by a NUL separator, then chunked into
                // DATA blocks like a file read.
                let mut bytes = Vec::new();
                for name in &names {
                    bytes.extend_from_slice(name.as_bytes());
                    bytes.push(0);
                }
                debug!(connection = self.id, files = names.len(), "directory listing");
                match build_blocks(&bytes) {
                    Some(queue) => self.start_sending(queue),
                    None => self.send_error(ErrorCode::NotDefined, "listing too large to transfer"),
                }
            }
            Err(e) => {
                warn!(connection = self.id, "directory listing failed: {e}");
                self.send_error(ErrorCode::NotDefined, "failed to list files");
            }
        }
    }

    async fn handle_read(&mut self, filename: String) {
        if self.registry.is_reserved(&filename) {
            // Upload still in flight; the file is not complete yet.
            self.send_error(ErrorCode::FileNotFound, "file not found");
            return;
        }
        let store = Arc::clone(&self.store);
        let name = filename.clone();
        // The whole block queue is built under the gate; the gate is
        // released before the first block goes out.
        let contents = self
            .registry
            .with_read_access(|| -> Result<Vec<u8>, StoreError> {
                let mut source = store.open_for_read(&name)?;
                let mut bytes = Vec::new();
                source.read_to_end(&mut bytes)?;
                Ok(bytes)
            })
            .await;
        match contents {
            Ok(bytes) => {
                debug!(connection = self.id, file = %filename, size = bytes.len(), "read request");
                match build_blocks(&bytes) {
                    Some(queue) => self.start_sending(queue),
                    None => self.send_error(ErrorCode::NotDefined, "file too large to transfer"),
                }
            }
            Err(StoreError::NotFound { .. }) => {
                self.send_error(ErrorCode::FileNotFound, "file not found")
            }
            Err(StoreError::AccessViolation { .. }) => {
                self.send_error(ErrorCode::NotDefined, "access violation")
            }
            Err(e) => {
                warn!(connection = self.id, file = %filename, "read failed: {e}");
                self.send_error(ErrorCode::NotDefined, "failed to read file");
            }
        }
    }

    fn handle_ack(&mut self, block: u16) {
        let transfer = mem::replace(&mut self.transfer, Transfer::Idle);
        match transfer {
            Transfer::Sending {
                mut queue,
                expected_ack,
            } => {
                if block != expected_ack {
                    warn!(
                        connection = self.id,
                        got = block,
                        expected = expected_ack,
                        "wrong block acknowledged, aborting transfer"
                    );
                    self.send_error(ErrorCode::NotDefined, "acknowledged the wrong block");
                    return;
                }
                match queue.pop_front() {
                    Some(next) => {
                        self.send(next);
                        // Bounded: build_blocks never numbers past u16::MAX.
                        self.transfer = Transfer::Sending {
                            queue,
                            expected_ack: expected_ack + 1,
                        };
                    }
                    None => debug!(connection = self.id, "read transfer complete"),
                }
            }
            other => {
                // Stray ack, e.g. arriving after an abort. Not a request, so
                // no ERROR reply.
                self.transfer = other;
                debug!(connection = self.id, block, "ACK with no transfer in flight");
            }
        }
    }

    async fn handle_write(&mut self, filename: String) {
        if self.registry.is_reserved(&filename) {
            self.send_error(ErrorCode::FileExists, "file already exists");
            return;
        }
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let name = filename.clone();
        let id = self.id;
        // Create and reserve atomically under the gate; the gate drops
        // before we wait for the first DATA block.
        let created = self
            .registry
            .with_write_access(|| -> Result<File, StoreError> {
                let sink = store.open_for_write(&name)?;
                let reserved = registry.reserve(&name, id);
                debug_assert!(reserved, "created a file whose name was reserved");
                Ok(sink)
            })
            .await;
        match created {
            Ok(sink) => {
                debug!(connection = self.id, file = %filename, "write request accepted");
                self.transfer = Transfer::Receiving {
                    filename,
                    sink,
                    next_block: 1,
                };
                self.send(Packet::Ack { block: 0 });
            }
            Err(StoreError::Exists { .. }) => {
                self.send_error(ErrorCode::FileExists, "file already exists")
            }
            Err(StoreError::AccessViolation { .. }) => {
                self.send_error(ErrorCode::NotDefined, "access violation")
            }
            Err(e) => {
                warn!(connection = self.id, file = %filename, "create failed: {e}");
                self.send_error(ErrorCode::NotDefined, "failed to create file");
            }
        }
    }

    async fn handle_data(&mut self, block: u16, payload: Vec<u8>) {
        let transfer = mem::replace(&mut self.transfer, Transfer::Idle);
        let (filename, mut sink, next_block) = match transfer {
            Transfer::Receiving {
                filename,
                sink,
                next_block,
            } => (filename, sink, next_block),
            other => {
                self.transfer = other;
                self.send_error(ErrorCode::NotDefined, "unexpected DATA packet");
                return;
            }
        };

        if block != next_block {
            warn!(
                connection = self.id,
                got = block,
                expected = next_block,
                file = %filename,
                "wrong block received, aborting upload"
            );
            drop(sink);
            self.abort_write(&filename).await;
            self.send_error(ErrorCode::NotDefined, "got the wrong block");
            return;
        }

        if !payload.is_empty() {
            let appended = self
                .registry
                .with_write_access(|| sink.write_all(&payload))
                .await;
            if let Err(e) = appended {
                warn!(connection = self.id, file = %filename, "append failed: {e}");
                drop(sink);
                self.abort_write(&filename).await;
                self.send_error(ErrorCode::NotDefined, "failed to write file");
                return;
            }
        }

        let last = payload.len() < BLOCK_SIZE;
        if !last && next_block == u16::MAX {
            // The next block number would wrap; give up rather than corrupt
            // the sequence.
            drop(sink);
            self.abort_write(&filename).await;
            self.send_error(ErrorCode::NotDefined, "file too large to transfer");
            return;
        }

        self.send(Packet::Ack { block });

        if last {
            // Final block: close the sink, free the name, tell everyone else.
            drop(sink);
            self.registry.release(&filename, self.id);
            info!(connection = self.id, file = %filename, "upload complete");
            self.registry.broadcast(
                self.id,
                Packet::Bcast {
                    added: true,
                    filename,
                },
            );
        } else {
            self.transfer = Transfer::Receiving {
                filename,
                sink,
                next_block: next_block + 1,
            };
        }
    }

    async fn handle_delete(&mut self, filename: String) {
        if self.registry.is_reserved(&filename) {
            self.send_error(ErrorCode::NotDefined, "file is being uploaded");
            return;
        }
        let store = Arc::clone(&self.store);
        let name = filename.clone();
        let deleted = self.registry.with_write_access(|| store.delete(&name)).await;
        match deleted {
            Ok(()) => {
                info!(connection = self.id, file = %filename, "deleted");
                self.send(Packet::Ack { block: 0 });
                self.registry.broadcast(
                    self.id,
                    Packet::Bcast {
                        added: false,
                        filename,
                    },
                );
            }
            Err(StoreError::NotFound { .. }) => {
                self.send_error(ErrorCode::FileNotFound, "file not found")
            }
            Err(StoreError::AccessViolation { .. }) => {
                self.send_error(ErrorCode::NotDefined, "access violation")
            }
            Err(e) => {
                warn!(connection = self.id, file = %filename, "delete failed: {e}");
                self.send_error(ErrorCode::NotDefined, "failed to delete file");
            }
        }
    }

    /// The peer reported an error: record it and roll back whatever transfer
    /// was in flight.
    async fn handle_peer_error(&mut self, code: ErrorCode, message: String) {
        warn!(connection = self.id, ?code, message = %message, "peer reported error");
        let transfer = mem::replace(&mut self.transfer, Transfer::Idle);
        match transfer {
            Transfer::Receiving { filename, sink, .. } => {
                drop(sink);
                self.abort_write(&filename).await;
            }
            // A read queue is just dropped.
            Transfer::Sending { .. } | Transfer::Idle => {}
        }
    }

    async fn handle_disconnect(&mut self) {
        let transfer = mem::replace(&mut self.transfer, Transfer::Idle);
        if let Transfer::Receiving { filename, sink, .. } = transfer {
            drop(sink);
            self.abort_write(&filename).await;
        }
        if let Some(name) = self.username.take() {
            self.registry.logout(&name);
            info!(connection = self.id, user = %name, "logged out");
        }
        self.send(Packet::Ack { block: 0 });
        self.registry.unregister(self.id);
        self.terminate = true;
    }

    /// Queue the first block and keep the rest for the ACK loop.
    fn start_sending(&mut self, mut queue: VecDeque<Packet>) {
        if let Some(first) = queue.pop_front() {
            self.transfer = Transfer::Sending {
                queue,
                expected_ack: 1,
            };
            self.send(first);
        }
    }

    /// Delete a partially written file and drop its reservation, both under
    /// the gate so the name is free the instant the gate releases.
    async fn abort_write(&self, filename: &str) {
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let id = self.id;
        let name = filename.to_string();
        let result = self
            .registry
            .with_write_access(move || {
                let deleted = store.delete(&name);
                registry.release(&name, id);
                deleted
            })
            .await;
        if let Err(e) = result {
            debug!(connection = self.id, file = %filename, "partial-file cleanup: {e}");
        }
    }

    fn send(&self, packet: Packet) {
        if !self.registry.send(self.id, packet) {
            debug!(connection = self.id, "send capability gone");
        }
    }

    fn send_error(&self, code: ErrorCode, message: &str) {
        self.send(Packet::Error {
            code,
            message: message.to_string(),
        });
    }
}

/// Split `bytes` into DATA blocks numbered from 1. Every transfer ends with
/// a block shorter than [`BLOCK_SIZE`]; when the input length is a multiple
/// of the block size (including zero) that final block is empty.
///
/// Returns `None` when the payload needs more blocks than a u16 counter can
/// number; block numbers are strictly increasing and never wrap.
fn build_blocks(bytes: &[u8]) -> Option<VecDeque<Packet>> {
    // One trailing block is always present, short or empty.
    if bytes.len() / BLOCK_SIZE + 1 > usize::from(u16::MAX) {
        return None;
    }
    let mut queue = VecDeque::new();
    let mut block: u16 = 1;
    for chunk in bytes.chunks(BLOCK_SIZE) {
        queue.push_back(Packet::Data {
            block,
            payload: chunk.to_vec(),
        });
        block += 1;
    }
    if bytes.len() % BLOCK_SIZE == 0 {
        queue.push_back(Packet::Data {
            block,
            payload: Vec::new(),
        });
    }
    Some(queue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Harness {
        registry: Arc<Registry>,
        store: Arc<FileStore>,
        _dir: tempfile::TempDir,
        next_id: ConnectionId,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self {
                registry: Arc::new(Registry::new()),
                store: Arc::new(FileStore::new(dir.path()).unwrap()),
                _dir: dir,
                next_id: 0,
            }
        }

        fn session(&mut self) -> (Session, UnboundedReceiver<Packet>) {
            self.next_id += 1;
            let (tx, rx) = mpsc::unbounded_channel();
            self.registry.register(self.next_id, tx);
            let session = Session::new(
                self.next_id,
                Arc::clone(&self.registry),
                Arc::clone(&self.store),
            );
            (session, rx)
        }

        async fn logged_in(&mut self, name: &str) -> (Session, UnboundedReceiver<Packet>) {
            let (mut session, mut rx) = self.session();
            session
                .process(Packet::Logrq {
                    username: name.into(),
                })
                .await;
            assert_eq!(rx.try_recv().unwrap(), Packet::Ack { block: 0 });
            (session, rx)
        }
    }

    fn recv(rx: &mut UnboundedReceiver<Packet>) -> Packet {
        rx.try_recv().expect("expected a reply")
    }

    fn assert_silent(rx: &mut UnboundedReceiver<Packet>) {
        assert!(rx.try_recv().is_err(), "unexpected packet queued");
    }

    fn error_code(packet: Packet) -> ErrorCode {
        match packet {
            Packet::Error { code, .. } => code,
            other => panic!("expected ERROR, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn requests_require_login() {
        let mut h = Harness::new();
        let (mut session, mut rx) = h.session();
        for packet in [
            Packet::Dirq,
            Packet::Rrq {
                filename: "a".into(),
            },
            Packet::Ack { block: 1 },
        ] {
            session.process(packet).await;
            assert_eq!(error_code(recv(&mut rx)), ErrorCode::NotLoggedIn);
        }
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let mut h = Harness::new();
        let (_alice, _rx_a) = h.logged_in("alice").await;

        let (mut imposter, mut rx_b) = h.session();
        imposter
            .process(Packet::Logrq {
                username: "alice".into(),
            })
            .await;
        assert_eq!(error_code(recv(&mut rx_b)), ErrorCode::NotDefined);

        // The loser is free to pick another name.
        imposter
            .process(Packet::Logrq {
                username: "bob".into(),
            })
            .await;
        assert_eq!(recv(&mut rx_b), Packet::Ack { block: 0 });
    }

    #[tokio::test]
    async fn double_login_same_session() {
        let mut h = Harness::new();
        let (mut session, mut rx) = h.logged_in("alice").await;
        session
            .process(Packet::Logrq {
                username: "alice2".into(),
            })
            .await;
        assert_eq!(error_code(recv(&mut rx)), ErrorCode::AlreadyLoggedIn);
    }

    #[tokio::test]
    async fn upload_ack_and_broadcast() {
        let mut h = Harness::new();
        let (mut alice, mut rx_a) = h.logged_in("alice").await;
        let (_bob, mut rx_b) = h.logged_in("bob").await;

        alice
            .process(Packet::Wrq {
                filename: "a.txt".into(),
            })
            .await;
        assert_eq!(recv(&mut rx_a), Packet::Ack { block: 0 });

        alice
            .process(Packet::Data {
                block: 1,
                payload: b"hello bftp".to_vec(),
            })
            .await;
        assert_eq!(recv(&mut rx_a), Packet::Ack { block: 1 });

        // Short block finished the upload: bob hears about it, alice does not.
        assert_eq!(
            recv(&mut rx_b),
            Packet::Bcast {
                added: true,
                filename: "a.txt".into()
            }
        );
        assert_silent(&mut rx_a);
        assert!(h.store.exists("a.txt").unwrap());
    }

    #[tokio::test]
    async fn download_blocks_are_monotonic() {
        let mut h = Harness::new();
        std::fs::write(h.store.root().join("big.bin"), vec![7u8; 1034]).unwrap();
        let (mut session, mut rx) = h.logged_in("alice").await;

        session
            .process(Packet::Rrq {
                filename: "big.bin".into(),
            })
            .await;
        for (block, len) in [(1u16, 512), (2, 512), (3, 10)] {
            match recv(&mut rx) {
                Packet::Data { block: b, payload } => {
                    assert_eq!(b, block);
                    assert_eq!(payload.len(), len);
                }
                other => panic!("expected DATA, got {other:?}"),
            }
            session.process(Packet::Ack { block }).await;
        }
        assert_silent(&mut rx);
    }

    #[tokio::test]
    async fn exact_multiple_gets_empty_final_block() {
        let mut h = Harness::new();
        std::fs::write(h.store.root().join("even.bin"), vec![1u8; 512]).unwrap();
        let (mut session, mut rx) = h.logged_in("alice").await;

        session
            .process(Packet::Rrq {
                filename: "even.bin".into(),
            })
            .await;
        assert!(matches!(recv(&mut rx), Packet::Data { block: 1, payload } if payload.len() == 512));
        session.process(Packet::Ack { block: 1 }).await;
        assert_eq!(
            recv(&mut rx),
            Packet::Data {
                block: 2,
                payload: Vec::new()
            }
        );
        session.process(Packet::Ack { block: 2 }).await;
        assert_silent(&mut rx);
    }

    #[tokio::test]
    async fn empty_file_sends_single_empty_block() {
        let mut h = Harness::new();
        std::fs::write(h.store.root().join("empty"), b"").unwrap();
        let (mut session, mut rx) = h.logged_in("alice").await;

        session
            .process(Packet::Rrq {
                filename: "empty".into(),
            })
            .await;
        assert_eq!(
            recv(&mut rx),
            Packet::Data {
                block: 1,
                payload: Vec::new()
            }
        );
        session.process(Packet::Ack { block: 1 }).await;
        assert_silent(&mut rx);
    }

    #[tokio::test]
    async fn missing_file_read() {
        let mut h = Harness::new();
        let (mut session, mut rx) = h.logged_in("alice").await;
        session
            .process(Packet::Rrq {
                filename: "ghost".into(),
            })
            .await;
        assert_eq!(error_code(recv(&mut rx)), ErrorCode::FileNotFound);
    }

    #[tokio::test]
    async fn wrong_ack_aborts_download() {
        let mut h = Harness::new();
        std::fs::write(h.store.root().join("f"), vec![0u8; 600]).unwrap();
        let (mut session, mut rx) = h.logged_in("alice").await;

        session.process(Packet::Rrq { filename: "f".into() }).await;
        assert!(matches!(recv(&mut rx), Packet::Data { block: 1, .. }));

        session.process(Packet::Ack { block: 9 }).await;
        assert_eq!(error_code(recv(&mut rx)), ErrorCode::NotDefined);

        // Back to READY: a fresh request goes through.
        session.process(Packet::Dirq).await;
        assert!(matches!(recv(&mut rx), Packet::Data { block: 1, .. }));
    }

    #[tokio::test]
    async fn wrong_block_upload_rolls_back() {
        let mut h = Harness::new();
        let (mut session, mut rx) = h.logged_in("alice").await;

        session
            .process(Packet::Wrq {
                filename: "up.bin".into(),
            })
            .await;
        assert_eq!(recv(&mut rx), Packet::Ack { block: 0 });

        session
            .process(Packet::Data {
                block: 1,
                payload: vec![9u8; 512],
            })
            .await;
        assert_eq!(recv(&mut rx), Packet::Ack { block: 1 });

        session
            .process(Packet::Data {
                block: 5,
                payload: vec![9u8; 10],
            })
            .await;
        assert_eq!(error_code(recv(&mut rx)), ErrorCode::NotDefined);

        // Partial file must be gone and the name usable again.
        assert!(!h.store.exists("up.bin").unwrap());
        assert!(!h.registry.is_reserved("up.bin"));
    }

    #[tokio::test]
    async fn existing_file_rejects_upload() {
        let mut h = Harness::new();
        std::fs::write(h.store.root().join("taken"), b"x").unwrap();
        let (mut session, mut rx) = h.logged_in("alice").await;
        session
            .process(Packet::Wrq {
                filename: "taken".into(),
            })
            .await;
        assert_eq!(error_code(recv(&mut rx)), ErrorCode::FileExists);
    }

    #[tokio::test]
    async fn reserved_name_blocks_other_requests() {
        let mut h = Harness::new();
        let (mut alice, mut rx_a) = h.logged_in("alice").await;
        let (mut bob, mut rx_b) = h.logged_in("bob").await;

        alice
            .process(Packet::Wrq {
                filename: "wip".into(),
            })
            .await;
        assert_eq!(recv(&mut rx_a), Packet::Ack { block: 0 });

        bob.process(Packet::Wrq {
            filename: "wip".into(),
        })
        .await;
        assert_eq!(error_code(recv(&mut rx_b)), ErrorCode::FileExists);

        bob.process(Packet::Rrq {
            filename: "wip".into(),
        })
        .await;
        assert_eq!(error_code(recv(&mut rx_b)), ErrorCode::FileNotFound);

        bob.process(Packet::Delrq {
            filename: "wip".into(),
        })
        .await;
        assert_eq!(error_code(recv(&mut rx_b)), ErrorCode::NotDefined);

        // Finish the upload; the name frees up.
        alice
            .process(Packet::Data {
                block: 1,
                payload: b"done".to_vec(),
            })
            .await;
        assert_eq!(recv(&mut rx_a), Packet::Ack { block: 1 });
        assert!(!h.registry.is_reserved("wip"));
    }

    #[tokio::test]
    async fn dir_listing_is_nul_separated() {
        let mut h = Harness::new();
        std::fs::write(h.store.root().join("a.txt"), b"1").unwrap();
        std::fs::write(h.store.root().join("b.txt"), b"2").unwrap();
        let (mut session, mut rx) = h.logged_in("alice").await;

        session.process(Packet::Dirq).await;
        let payload = match recv(&mut rx) {
            Packet::Data { block: 1, payload } => payload,
            other => panic!("expected DATA, got {other:?}"),
        };
        let mut names: Vec<&str> = std::str::from_utf8(&payload)
            .unwrap()
            .split_terminator('\0')
            .collect();
        names.sort_unstable();
        assert_eq!(names, vec!["a.txt", "b.txt"]);

        session.process(Packet::Ack { block: 1 }).await;
        assert_silent(&mut rx);
    }

    #[tokio::test]
    async fn empty_dir_listing_sends_empty_block() {
        let mut h = Harness::new();
        let (mut session, mut rx) = h.logged_in("alice").await;
        session.process(Packet::Dirq).await;
        assert_eq!(
            recv(&mut rx),
            Packet::Data {
                block: 1,
                payload: Vec::new()
            }
        );
    }

    #[tokio::test]
    async fn delete_broadcasts_to_others_only() {
        let mut h = Harness::new();
        std::fs::write(h.store.root().join("doomed"), b"x").unwrap();
        let (mut alice, mut rx_a) = h.logged_in("alice").await;
        let (_bob, mut rx_b) = h.logged_in("bob").await;

        alice
            .process(Packet::Delrq {
                filename: "doomed".into(),
            })
            .await;
        assert_eq!(recv(&mut rx_a), Packet::Ack { block: 0 });
        assert_eq!(
            recv(&mut rx_b),
            Packet::Bcast {
                added: false,
                filename: "doomed".into()
            }
        );
        assert_silent(&mut rx_a);
        assert!(!h.store.exists("doomed").unwrap());
    }

    #[tokio::test]
    async fn disconnect_works_in_any_state() {
        let mut h = Harness::new();
        let (mut session, mut rx) = h.session();
        session.process(Packet::Disc).await;
        assert_eq!(recv(&mut rx), Packet::Ack { block: 0 });
        assert!(session.should_terminate());
    }

    #[tokio::test]
    async fn disconnect_frees_username() {
        let mut h = Harness::new();
        let (mut session, mut rx) = h.logged_in("alice").await;
        session.process(Packet::Disc).await;
        assert_eq!(recv(&mut rx), Packet::Ack { block: 0 });
        assert!(session.should_terminate());
        assert!(!h.registry.is_logged_in("alice"));
    }

    #[tokio::test]
    async fn bcast_from_client_is_illegal() {
        let mut h = Harness::new();
        let (mut session, mut rx) = h.logged_in("alice").await;
        session
            .process(Packet::Bcast {
                added: true,
                filename: "x".into(),
            })
            .await;
        assert_eq!(error_code(recv(&mut rx)), ErrorCode::IllegalOperation);
    }

    #[tokio::test]
    async fn peer_error_rolls_back_upload() {
        let mut h = Harness::new();
        let (mut session, mut rx) = h.logged_in("alice").await;
        session
            .process(Packet::Wrq {
                filename: "part".into(),
            })
            .await;
        assert_eq!(recv(&mut rx), Packet::Ack { block: 0 });

        session
            .process(Packet::Error {
                code: ErrorCode::NotDefined,
                message: "client gave up".into(),
            })
            .await;
        assert_silent(&mut rx);
        assert!(!h.store.exists("part").unwrap());
        assert!(!h.registry.is_reserved("part"));
    }

    #[tokio::test]
    async fn abrupt_close_rolls_back_and_logs_out() {
        let mut h = Harness::new();
        let (mut session, mut rx) = h.logged_in("alice").await;
        session
            .process(Packet::Wrq {
                filename: "part".into(),
            })
            .await;
        assert_eq!(recv(&mut rx), Packet::Ack { block: 0 });

        session.close().await;
        assert!(!h.store.exists("part").unwrap());
        assert!(!h.registry.is_reserved("part"));
        assert!(!h.registry.is_logged_in("alice"));
    }

    #[tokio::test]
    async fn data_without_write_transfer_is_rejected() {
        let mut h = Harness::new();
        let (mut session, mut rx) = h.logged_in("alice").await;

        session
            .process(Packet::Data {
                block: 1,
                payload: b"stray".to_vec(),
            })
            .await;
        assert_eq!(error_code(recv(&mut rx)), ErrorCode::NotDefined);

        // Still READY afterwards.
        session.process(Packet::Dirq).await;
        assert!(matches!(recv(&mut rx), Packet::Data { block: 1, .. }));
    }

    #[tokio::test]
    async fn stray_ack_is_ignored() {
        let mut h = Harness::new();
        let (mut session, mut rx) = h.logged_in("alice").await;

        // An ACK with nothing in flight is not a request: no reply at all.
        session.process(Packet::Ack { block: 3 }).await;
        assert_silent(&mut rx);

        session.process(Packet::Dirq).await;
        assert!(matches!(recv(&mut rx), Packet::Data { block: 1, .. }));
    }

    #[tokio::test]
    async fn peer_error_drops_read_queue() {
        let mut h = Harness::new();
        std::fs::write(h.store.root().join("f"), vec![0u8; 600]).unwrap();
        let (mut session, mut rx) = h.logged_in("alice").await;

        session.process(Packet::Rrq { filename: "f".into() }).await;
        assert!(matches!(recv(&mut rx), Packet::Data { block: 1, .. }));

        session
            .process(Packet::Error {
                code: ErrorCode::NotDefined,
                message: "client gave up".into(),
            })
            .await;
        assert_silent(&mut rx);

        // The queue is gone: the ACK for the dropped block is stray, and a
        // fresh request starts over at block 1.
        session.process(Packet::Ack { block: 1 }).await;
        assert_silent(&mut rx);
        session.process(Packet::Rrq { filename: "f".into() }).await;
        assert!(matches!(recv(&mut rx), Packet::Data { block: 1, .. }));
    }

    #[tokio::test]
    async fn aborted_upload_name_is_immediately_reusable() {
        let mut h = Harness::new();
        let (mut session, mut rx) = h.logged_in("alice").await;

        session
            .process(Packet::Wrq {
                filename: "up.bin".into(),
            })
            .await;
        assert_eq!(recv(&mut rx), Packet::Ack { block: 0 });
        session
            .process(Packet::Data {
                block: 7,
                payload: vec![1u8; 10],
            })
            .await;
        assert_eq!(error_code(recv(&mut rx)), ErrorCode::NotDefined);

        // Rollback freed both the file and the reservation, so the same
        // name is accepted again right away.
        session
            .process(Packet::Wrq {
                filename: "up.bin".into(),
            })
            .await;
        assert_eq!(recv(&mut rx), Packet::Ack { block: 0 });
    }

    #[test]
    fn block_numbers_never_wrap() {
        // Largest payload that still fits a u16 block counter, and the
        // first one that does not.
        let max_len = BLOCK_SIZE * (usize::from(u16::MAX) - 1);
        let queue = build_blocks(&vec![0u8; max_len]).expect("should fit");
        assert_eq!(queue.len(), usize::from(u16::MAX));
        match queue.back().unwrap() {
            Packet::Data { block, payload } => {
                assert_eq!(*block, u16::MAX);
                assert!(payload.is_empty());
            }
            other => panic!("expected DATA, got {other:?}"),
        }

        // One more full block would need number 65536.
        assert!(build_blocks(&vec![0u8; BLOCK_SIZE * usize::from(u16::MAX)]).is_none());
    }

    #[tokio::test]
    async fn request_during_transfer_is_rejected() {
        let mut h = Harness::new();
        std::fs::write(h.store.root().join("f"), vec![0u8; 600]).unwrap();
        let (mut session, mut rx) = h.logged_in("alice").await;

        session.process(Packet::Rrq { filename: "f".into() }).await;
        assert!(matches!(recv(&mut rx), Packet::Data { block: 1, .. }));

        session.process(Packet::Dirq).await;
        assert_eq!(error_code(recv(&mut rx)), ErrorCode::NotDefined);

        // The original transfer is still alive.
        session.process(Packet::Ack { block: 1 }).await;
        assert!(matches!(recv(&mut rx), Packet::Data { block: 2, .. }));
    }
}
