// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame submission surface.
//!
//! [`vvc::VvcDecoder`] accepts picture units, drives the DPB and the slice decoders, and hands
//! decoded pictures back in output order. This module holds what is not specific to it: the
//! error type, the configuration and the queue of pictures ready for output.

pub mod vvc;

use std::collections::VecDeque;

use enumn::N;
use thiserror::Error;

use crate::codec::vvc::dpb::DpbError;

/// Error returned by the decoder surface.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Dpb(#[from] DpbError),
    #[error("a slice was received before any sequence parameters")]
    NoDpb,
    #[error("invalid decoder option {0}")]
    InvalidOption(u32),
    #[error(transparent)]
    DecoderError(#[from] anyhow::Error),
    #[error("cannot parse headers: {0:#}")]
    Header(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Options settable with [`DecoderConfig::set_option`], by their integer id.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DecoderOption {
    /// Non-zero to output pictures. When 0, pictures are decoded for reference only.
    DisplayOutput = 0,
    /// Pictures decoded in parallel. 0 for one per available core.
    FrameThreads = 1,
    /// Threads working on the CTU rows of one picture.
    EntryThreads = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    pub display_output: bool,
    pub nb_frame_threads: i32,
    pub nb_entry_threads: i32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            display_output: true,
            nb_frame_threads: 1,
            nb_entry_threads: 1,
        }
    }
}

impl DecoderConfig {
    pub fn set_option(&mut self, id: u32, value: i32) -> Result<()> {
        let option = DecoderOption::n(id).ok_or(DecodeError::InvalidOption(id))?;
        log::debug!("Setting {:?} to {}", option, value);

        match option {
            DecoderOption::DisplayOutput => self.display_output = value != 0,
            DecoderOption::FrameThreads => self.nb_frame_threads = value,
            DecoderOption::EntryThreads => self.nb_entry_threads = value,
        }
        Ok(())
    }

    /// Number of pictures decoded concurrently.
    pub fn frame_threads(&self) -> usize {
        match self.nb_frame_threads {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n.max(1) as usize,
        }
    }
}

/// A queue where decoded pictures wait until they are retrieved by the client.
pub(crate) struct ReadyFramesQueue<T> {
    /// Queue of all the frames waiting to be sent to the client.
    queue: VecDeque<T>,
}

impl<T> Default for ReadyFramesQueue<T> {
    fn default() -> Self {
        Self {
            queue: Default::default(),
        }
    }
}

impl<T> ReadyFramesQueue<T> {
    /// Push `frame` to the back of the queue.
    pub(crate) fn push(&mut self, frame: T) {
        self.queue.push_back(frame)
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

impl<T> Extend<T> for ReadyFramesQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.queue.extend(iter)
    }
}

/// Allows us to manipulate the frames list like an iterator without consuming it.
impl<'a, T> Iterator for &'a mut ReadyFramesQueue<T> {
    type Item = T;

    /// Returns the next frame (if any) waiting to be dequeued.
    fn next(&mut self) -> Option<T> {
        self.queue.pop_front()
    }
}
