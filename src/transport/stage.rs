//! Frame stages between the socket and the protocol codec.
//!
//! The pipeline is fixed when a connection is built: outbound frames pass
//! through every stage in order, inbound frames in reverse order. Both peers
//! must be configured with the same stages.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;

use super::{MessagingError, Result};

/// Whole-frame compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Lz4,
    Gzip,
}

/// One transform applied to every frame body.
pub(crate) trait FrameStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode(&self, frame: Bytes) -> Result<Bytes>;

    fn decode(&self, frame: Bytes) -> Result<Bytes>;
}

/// Ordered list of stages.
pub(crate) struct FramePipeline {
    stages: Vec<Box<dyn FrameStage>>,
}

impl FramePipeline {
    pub(crate) fn new(stages: Vec<Box<dyn FrameStage>>) -> Self {
        Self { stages }
    }

    pub(crate) fn for_compression(algorithm: CompressionAlgorithm, max_frame_length: usize) -> Self {
        let stages: Vec<Box<dyn FrameStage>> = match algorithm {
            CompressionAlgorithm::None => Vec::new(),
            CompressionAlgorithm::Lz4 => vec![Box::new(Lz4Stage { max_frame_length })],
            CompressionAlgorithm::Gzip => vec![Box::new(GzipStage { max_frame_length })],
        };
        Self::new(stages)
    }

    pub(crate) fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub(crate) fn encode(&self, frame: Bytes) -> Result<Bytes> {
        self.stages
            .iter()
            .try_fold(frame, |frame, stage| stage.encode(frame))
    }

    pub(crate) fn decode(&self, frame: Bytes) -> Result<Bytes> {
        self.stages
            .iter()
            .rev()
            .try_fold(frame, |frame, stage| stage.decode(frame))
    }
}

fn corrupt(stage: &str, reason: impl std::fmt::Display) -> MessagingError {
    MessagingError::ProtocolException(format!("{stage} stage: {reason}"))
}

struct Lz4Stage {
    max_frame_length: usize,
}

impl FrameStage for Lz4Stage {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn encode(&self, frame: Bytes) -> Result<Bytes> {
        Ok(Bytes::from(lz4_flex::compress_prepend_size(&frame)))
    }

    fn decode(&self, frame: Bytes) -> Result<Bytes> {
        // Uncompressed size is a little-endian u32 prefix.
        let declared = frame
            .get(..4)
            .map(|size| u32::from_le_bytes([size[0], size[1], size[2], size[3]]) as usize)
            .ok_or_else(|| corrupt(self.name(), "missing size prefix"))?;
        if declared > self.max_frame_length {
            return Err(corrupt(
                self.name(),
                format!("frame of {declared} bytes exceeds {}", self.max_frame_length),
            ));
        }
        lz4_flex::decompress_size_prepended(&frame)
            .map(Bytes::from)
            .map_err(|e| corrupt(self.name(), e))
    }
}

struct GzipStage {
    max_frame_length: usize,
}

impl FrameStage for GzipStage {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn encode(&self, frame: Bytes) -> Result<Bytes> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(frame.len() / 2), Compression::fast());
        encoder.write_all(&frame)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    fn decode(&self, frame: Bytes) -> Result<Bytes> {
        let mut out = Vec::with_capacity(frame.len() * 2);
        GzDecoder::new(&frame[..])
            .take(self.max_frame_length as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| corrupt(self.name(), e))?;
        if out.len() > self.max_frame_length {
            return Err(corrupt(
                self.name(),
                format!("frame exceeds {} bytes", self.max_frame_length),
            ));
        }
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_compression_is_empty_pipeline() {
        let pipeline = FramePipeline::for_compression(CompressionAlgorithm::None, 1024);
        assert!(pipeline.stage_names().is_empty());

        let frame = Bytes::from_static(b"unchanged");
        assert_eq!(pipeline.encode(frame.clone()).unwrap(), frame);
    }

    #[test]
    fn test_lz4_shrinks_repetitive_frames() {
        let pipeline = FramePipeline::for_compression(CompressionAlgorithm::Lz4, 1 << 20);
        let frame = Bytes::from(vec![7u8; 4096]);

        let encoded = pipeline.encode(frame.clone()).unwrap();
        assert!(encoded.len() < frame.len());
        assert_eq!(pipeline.decode(encoded).unwrap(), frame);
    }

    #[test]
    fn test_gzip_rejects_oversized_frames() {
        let writer = FramePipeline::for_compression(CompressionAlgorithm::Gzip, 1 << 20);
        let reader = FramePipeline::for_compression(CompressionAlgorithm::Gzip, 1024);

        let encoded = writer.encode(Bytes::from(vec![1u8; 4096])).unwrap();
        let err = reader.decode(encoded).unwrap_err();
        assert!(matches!(err, MessagingError::ProtocolException(_)));
    }

    #[test]
    fn test_corrupt_lz4_frame_is_protocol_error() {
        let pipeline = FramePipeline::for_compression(CompressionAlgorithm::Lz4, 1 << 20);
        let err = pipeline
            .decode(Bytes::from_static(&[16, 0, 0, 0, 0xff, 0xff]))
            .unwrap_err();
        assert!(matches!(err, MessagingError::ProtocolException(_)));
    }
}
