//! Collaborator interfaces the engine drives.
//!
//! The engine never parses containers, decodes media or touches an output
//! device itself. It talks to three collaborators:
//!
//! - [`ContainerProbe`] / [`Container`]: open a source and read packets from it.
//! - [`CodecLibrary`] / [`Decoder`]: turn compressed packets into raw frames.
//! - [`PresentationBackend`] / [`Surface`]: put decoded frames somewhere.
//!
//! Implementations may report failures with any error type through
//! [`anyhow::Result`]; stages convert them into the typed errors in
//! [`crate::utils::errors`] at the stage boundary.

use std::path::Path;

use anyhow::Result;

use crate::structs::frame::{DecodedFrame, RawFrame};
use crate::structs::packet::{CompressedPacket, RawPacket};
use crate::structs::stream::{FormatParams, StreamDescriptor};
use crate::utils::errors::OpenError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    Packet(RawPacket),
    /// A stream's format became known after open.
    Format {
        stream_index: u32,
        params: FormatParams,
    },
    Eof,
}

pub trait Container: Send {
    fn read(&mut self) -> Result<ReadEvent>;
}

pub trait ContainerProbe: Send + Sync {
    fn open(&self, path: &Path) -> Result<(Vec<StreamDescriptor>, Box<dyn Container>), OpenError>;
}

pub trait Decoder: Send {
    fn decode(&mut self, packet: &CompressedPacket) -> Result<Vec<RawFrame>>;

    fn output_format(&self) -> FormatParams;
}

pub trait CodecLibrary: Send + Sync {
    fn open_decoder(
        &self,
        descriptor: &StreamDescriptor,
        params: &FormatParams,
    ) -> Result<Box<dyn Decoder>>;
}

pub trait Surface: Send {
    fn present(&mut self, frame: &DecodedFrame) -> Result<()>;

    /// Called once after the last frame of the stream.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

pub trait PresentationBackend: Send + Sync {
    fn configure(
        &self,
        descriptor: &StreamDescriptor,
        params: &FormatParams,
    ) -> Result<Box<dyn Surface>>;
}
