// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Display frame assembly.
//!
//! Two frame buffers: the front one is on display, the back one is where the
//! next frame is put together. A frame arrives one of two ways, pushed over
//! endpoint 0 with `PUSH_FRAME` or streamed as packets on the bulk frame
//! endpoint, and only one of those can own the back buffer at a time. A
//! finished frame waits in the back buffer until [`FrameBuffers::present`]
//! swaps it to the front at the next display frame boundary.
//!
//! The bulk stream has no framing of its own. A frame ends when the buffer
//! is full or when the host sends a short packet, the usual USB way of
//! ending a transfer. A short packet that leaves the frame incomplete, or a
//! packet that doesn't fit, throws the frame away and the stream is stalled
//! so the host starts over on a frame boundary.

use log::{debug, trace};

/// What the back buffer is being filled from, and how far it's got.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Filling {
    Nothing,
    Pushed(usize),
    Streamed(usize),
}

pub struct FrameBuffers<const N: usize> {
    frames: [[u8; N]; 2],
    front: usize,
    filling: Filling,
    /// The back buffer holds a complete frame.
    ready: bool,
    /// Max packet size of the stream endpoint. Anything shorter ends a frame.
    stream_packet: usize,
}

impl<const N: usize> FrameBuffers<N> {
    pub const fn new(stream_packet: usize) -> Self {
        Self {
            frames: [[0; N]; 2],
            front: 0,
            filling: Filling::Nothing,
            ready: false,
            stream_packet,
        }
    }

    /// The frame on display.
    pub fn front(&self) -> &[u8; N] {
        &self.frames[self.front]
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Bytes still missing from the pushed frame, starting a new one if
    /// nothing is being assembled. `None` while the back buffer is taken,
    /// either by the stream or by a finished frame not shown yet.
    pub fn push_remaining(&mut self) -> Option<usize> {
        match self.filling {
            Filling::Pushed(n) => Some(N - n),
            Filling::Streamed(_) => None,
            Filling::Nothing if self.ready => None,
            Filling::Nothing => {
                self.filling = Filling::Pushed(0);
                Some(N)
            }
        }
    }

    /// Appends to the pushed frame. Ignored unless a push is under way.
    pub fn push(&mut self, data: &[u8]) {
        if let Filling::Pushed(n) = self.filling {
            let end = self.fill(n, data);
            if end == N {
                self.finish();
            } else {
                self.filling = Filling::Pushed(end);
            }
        }
    }

    pub fn abort_push(&mut self) {
        if let Filling::Pushed(n) = self.filling {
            debug!("pushed frame dropped at {n} of {N} bytes");
            self.filling = Filling::Nothing;
        }
    }

    /// Takes one packet of the bulk stream. `false` means the packet was
    /// refused and the stream should stall; any partial frame is gone.
    pub fn stream(&mut self, data: &[u8]) -> bool {
        let at = match self.filling {
            Filling::Pushed(_) => return false,
            Filling::Streamed(n) => n,
            // Nothing to end.
            Filling::Nothing if data.is_empty() => return true,
            Filling::Nothing if self.ready => {
                debug!("stream frame with no free buffer");
                return false;
            }
            Filling::Nothing => 0,
        };
        let end = self.fill(at, data);
        if end - at < data.len() {
            debug!("stream frame overrun by {} bytes", data.len() - (end - at));
            self.filling = Filling::Nothing;
            return false;
        }
        if end == N {
            self.finish();
            return true;
        }
        if data.len() < self.stream_packet {
            debug!("short stream frame, {end} of {N} bytes");
            self.filling = Filling::Nothing;
            return false;
        }
        self.filling = Filling::Streamed(end);
        true
    }

    /// Drops a half-received stream frame.
    pub fn stream_reset(&mut self) {
        if let Filling::Streamed(_) = self.filling {
            self.filling = Filling::Nothing;
        }
    }

    /// Display frame boundary. Brings a finished frame to the front and
    /// returns `true`, or leaves the current one up.
    pub fn present(&mut self) -> bool {
        if !self.ready {
            return false;
        }
        self.ready = false;
        self.front = 1 - self.front;
        true
    }

    /// Copies as much of `data` as fits at `at`. Returns the new fill level.
    fn fill(&mut self, at: usize, data: &[u8]) -> usize {
        let end = (at + data.len()).min(N);
        self.frames[1 - self.front][at..end].copy_from_slice(&data[..end - at]);
        end
    }

    fn finish(&mut self) {
        trace!("frame complete from {:?}", self.filling);
        self.ready = true;
        self.filling = Filling::Nothing;
    }
}
