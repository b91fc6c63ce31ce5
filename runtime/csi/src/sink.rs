// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use {
    super::*,
    sdrv_csi_protocols::kstream::{KstreamBuffer, KstreamDevice, Vb2BufferState, Vb2Core},
    std::sync::{mpsc, Mutex, Weak},
};

/// The queue of image pipe, to deliver returned buffers to the event loop.
#[derive(Debug)]
pub struct FrameSink {
    pipe: u32,
    tx: mpsc::SyncSender<Event>,
    // The pipe to take the buffer which the event loop can not receive.
    kstream: Mutex<Weak<KstreamDevice>>,
}

impl FrameSink {
    pub fn new(pipe: u32, tx: mpsc::SyncSender<Event>) -> Self {
        Self {
            pipe,
            tx,
            kstream: Default::default(),
        }
    }

    pub fn attach(&self, kstream: &Arc<KstreamDevice>) {
        if let Ok(mut entry) = self.kstream.lock() {
            *entry = Arc::downgrade(kstream);
        }
    }

    fn hand_back(&self, buf: KstreamBuffer) {
        let kstream = self.kstream.lock().ok().and_then(|entry| entry.upgrade());
        match kstream.map(|kstream| kstream.requeue_buffer(buf)) {
            Some(Ok(())) => debug!(pipe = self.pipe, "Buffer is queued again"),
            Some(Err(buf)) => debug!(pipe = self.pipe, index = buf.index, "Buffer is released"),
            None => warn!(pipe = self.pipe, "Frame is dropped"),
        }
    }
}

impl Vb2Core for FrameSink {
    fn buffer_done(&self, buf: KstreamBuffer, state: Vb2BufferState) {
        // Called in interrupt context, thus never blocks.
        match self.tx.try_send(Event::Frame(self.pipe, buf, state)) {
            Ok(()) => (),
            Err(mpsc::TrySendError::Full(Event::Frame(_, buf, _))) => {
                warn!(pipe = self.pipe, index = buf.index, "Event queue is full");
                self.hand_back(buf);
            }
            Err(e) => warn!(pipe = self.pipe, "Frame is dropped: {}", e),
        }
    }
}
