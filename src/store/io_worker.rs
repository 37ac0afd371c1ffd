//! Background worker servicing pending record reads.
//!
//! Sessions submit `(guid, pending id, address, len)` requests; the worker
//! reads from the device on its own thread and queues completions, which
//! sessions drain in `complete_pending`.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::address::Address;
use crate::device::SyncDevice;

pub(crate) struct ReadRequest {
    pub guid: Uuid,
    pub pending_id: u64,
    pub address: Address,
    pub len: usize,
}

pub(crate) struct ReadCompletion {
    pub guid: Uuid,
    pub pending_id: u64,
    pub result: io::Result<Vec<u8>>,
}

enum WorkerMessage {
    Read(ReadRequest),
    Shutdown,
}

pub(crate) struct IoWorker {
    tx: Sender<WorkerMessage>,
    rx: Receiver<ReadCompletion>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IoWorker {
    pub fn new<D: SyncDevice>(device: Arc<D>) -> Self {
        let (tx, request_rx) = unbounded::<WorkerMessage>();
        let (completion_tx, rx) = unbounded::<ReadCompletion>();

        let handle = thread::Builder::new()
            .name("tidekv-io".into())
            .spawn(move || {
                while let Ok(message) = request_rx.recv() {
                    match message {
                        WorkerMessage::Read(request) => {
                            let mut buf = vec![0u8; request.len];
                            let result = device
                                .read_at(request.address.control(), &mut buf)
                                .map(|_| buf);
                            let _ = completion_tx.send(ReadCompletion {
                                guid: request.guid,
                                pending_id: request.pending_id,
                                result,
                            });
                        }
                        WorkerMessage::Shutdown => break,
                    }
                }
            })
            .expect("spawn io worker");

        Self {
            tx,
            rx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Submit a read; false means the worker is gone (store shutting down).
    pub fn submit(&self, request: ReadRequest) -> bool {
        self.tx.send(WorkerMessage::Read(request)).is_ok()
    }

    /// Non-blocking drain of everything completed so far.
    pub fn drain(&self) -> Vec<ReadCompletion> {
        let mut completions = Vec::new();
        while let Ok(completion) = self.rx.try_recv() {
            completions.push(completion);
        }
        completions
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerMessage::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}
