//! Cross-partition frontier exchange.
//!
//! Between supersteps each partition hands the barrier the set of work unit
//! ids it discovered for every other partition. The strategy chosen at job
//! start fixes only how those sets travel (the wire bytes); it never changes
//! what the aggregation merge computes. Ids are opaque u64 values with set
//! semantics: encoders normalize to sorted unique ids and decoders return
//! them the same way.

use crate::error::EngineError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

const ZSTD_LEVEL: i32 = 3;

/// Ids per bitmap page, so a page covers one aligned 64Ki id range.
const PAGE_SPAN: u64 = 65_536;
const PAGE_BYTES: usize = (PAGE_SPAN / 8) as usize;

/// Wire format for frontier exchange. Fixed for the whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommStrategy {
    /// Whole frontier as one zstd frame. The default.
    CompressedSingle,
    /// Frontier chunked into at most `max_exchange_units` independently
    /// compressed blocks.
    BoundedMulti,
    /// Uncompressed paged bitmaps, one bit per id.
    FlatBitmap,
}

impl CommStrategy {
    pub fn parse(name: &str) -> Result<Self, EngineError> {
        match name {
            "compressed_sp" => Ok(CommStrategy::CompressedSingle),
            "bounded_mp" => Ok(CommStrategy::BoundedMulti),
            "flat_bitmap" => Ok(CommStrategy::FlatBitmap),
            other => Err(EngineError::UnsupportedStrategy(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommStrategy::CompressedSingle => "compressed_sp",
            CommStrategy::BoundedMulti => "bounded_mp",
            CommStrategy::FlatBitmap => "flat_bitmap",
        }
    }

    /// Codec for this strategy. `max_exchange_units` only matters to the
    /// bounded multi-block format.
    pub fn codec(&self, max_exchange_units: usize) -> Box<dyn FrontierCodec> {
        match self {
            CommStrategy::CompressedSingle => Box::new(CompressedSingleCodec),
            CommStrategy::BoundedMulti => Box::new(BoundedMultiCodec {
                max_blocks: max_exchange_units.max(1),
            }),
            CommStrategy::FlatBitmap => Box::new(FlatBitmapCodec),
        }
    }
}

impl std::fmt::Display for CommStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sorted unique ids, the canonical frontier shape.
pub fn normalize(mut units: Vec<u64>) -> Vec<u64> {
    units.sort_unstable();
    units.dedup();
    units
}

/// Partition a work unit id belongs to.
pub fn route(unit: u64, num_partitions: usize) -> usize {
    (unit % num_partitions.max(1) as u64) as usize
}

pub trait FrontierCodec: Send + Sync {
    fn strategy(&self) -> CommStrategy;
    fn encode(&self, units: &[u64]) -> Result<Vec<u8>, EngineError>;
    fn decode(&self, bytes: &[u8]) -> Result<Vec<u64>, EngineError>;
}

fn exchange_error(strategy: CommStrategy, err: impl std::fmt::Display) -> EngineError {
    EngineError::Exchange {
        strategy: strategy.as_str(),
        message: err.to_string(),
    }
}

fn units_to_bytes(units: &[u64]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(units.len() * 8);
    for &unit in units {
        raw.extend_from_slice(&unit.to_le_bytes());
    }
    raw
}

fn bytes_to_units(strategy: CommStrategy, raw: &[u8], count: usize) -> Result<Vec<u64>, EngineError> {
    if raw.len() != count * 8 {
        return Err(exchange_error(
            strategy,
            format!("expected {} payload bytes, got {}", count * 8, raw.len()),
        ));
    }
    let mut cursor = std::io::Cursor::new(raw);
    let mut units = Vec::with_capacity(count);
    for _ in 0..count {
        units.push(
            cursor
                .read_u64::<LittleEndian>()
                .map_err(|e| exchange_error(strategy, e))?,
        );
    }
    Ok(units)
}

/// One `[u32 count][zstd frame]` per frontier.
pub struct CompressedSingleCodec;

impl FrontierCodec for CompressedSingleCodec {
    fn strategy(&self) -> CommStrategy {
        CommStrategy::CompressedSingle
    }

    fn encode(&self, units: &[u64]) -> Result<Vec<u8>, EngineError> {
        let units = normalize(units.to_vec());
        let raw = units_to_bytes(&units);
        let frame = zstd::bulk::compress(&raw, ZSTD_LEVEL)
            .map_err(|e| exchange_error(self.strategy(), e))?;
        let mut out = Vec::with_capacity(4 + frame.len());
        out.write_u32::<LittleEndian>(units.len() as u32)
            .map_err(|e| exchange_error(self.strategy(), e))?;
        out.extend_from_slice(&frame);
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u64>, EngineError> {
        let mut cursor = std::io::Cursor::new(bytes);
        let count = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| exchange_error(self.strategy(), e))? as usize;
        let frame = &bytes[cursor.position() as usize..];
        let raw = zstd::bulk::decompress(frame, count * 8)
            .map_err(|e| exchange_error(self.strategy(), e))?;
        bytes_to_units(self.strategy(), &raw, count)
    }
}

/// `[u32 block_count]` then per block `[u32 count][u32 len][zstd frame]`.
/// Blocks are contiguous ranges of the sorted frontier, never more than
/// `max_blocks` of them.
pub struct BoundedMultiCodec {
    pub max_blocks: usize,
}

impl FrontierCodec for BoundedMultiCodec {
    fn strategy(&self) -> CommStrategy {
        CommStrategy::BoundedMulti
    }

    fn encode(&self, units: &[u64]) -> Result<Vec<u8>, EngineError> {
        let units = normalize(units.to_vec());
        let block_size = if units.is_empty() {
            1
        } else {
            units.len().div_ceil(self.max_blocks)
        };
        let blocks: Vec<&[u64]> = units.chunks(block_size).collect();

        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(blocks.len() as u32)
            .map_err(|e| exchange_error(self.strategy(), e))?;
        for block in blocks {
            let frame = zstd::bulk::compress(&units_to_bytes(block), ZSTD_LEVEL)
                .map_err(|e| exchange_error(self.strategy(), e))?;
            out.write_u32::<LittleEndian>(block.len() as u32)
                .map_err(|e| exchange_error(self.strategy(), e))?;
            out.write_u32::<LittleEndian>(frame.len() as u32)
                .map_err(|e| exchange_error(self.strategy(), e))?;
            out.extend_from_slice(&frame);
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u64>, EngineError> {
        let mut cursor = std::io::Cursor::new(bytes);
        let block_count = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| exchange_error(self.strategy(), e))? as usize;

        let mut units = Vec::new();
        for _ in 0..block_count {
            let count = cursor
                .read_u32::<LittleEndian>()
                .map_err(|e| exchange_error(self.strategy(), e))? as usize;
            let len = cursor
                .read_u32::<LittleEndian>()
                .map_err(|e| exchange_error(self.strategy(), e))? as usize;
            let mut frame = vec![0u8; len];
            cursor
                .read_exact(&mut frame)
                .map_err(|e| exchange_error(self.strategy(), e))?;
            let raw = zstd::bulk::decompress(&frame, count * 8)
                .map_err(|e| exchange_error(self.strategy(), e))?;
            units.extend(bytes_to_units(self.strategy(), &raw, count)?);
        }
        Ok(normalize(units))
    }
}

/// `[u32 page_count]` then per page `[u64 page_index][8 KiB raw bitmap]`.
/// Only pages with at least one set bit are sent, so sparse frontiers stay
/// small without compression. The page index is the id's high 48 bits, so
/// the full u64 id space is representable.
pub struct FlatBitmapCodec;

impl FrontierCodec for FlatBitmapCodec {
    fn strategy(&self) -> CommStrategy {
        CommStrategy::FlatBitmap
    }

    fn encode(&self, units: &[u64]) -> Result<Vec<u8>, EngineError> {
        let units = normalize(units.to_vec());
        let mut pages: Vec<(u64, Box<[u8; PAGE_BYTES]>)> = Vec::new();
        for unit in units {
            let page_index = unit / PAGE_SPAN;
            let bit = (unit % PAGE_SPAN) as usize;
            // Sorted input keeps the current page last.
            if pages.last().map(|(index, _)| *index) != Some(page_index) {
                pages.push((page_index, Box::new([0u8; PAGE_BYTES])));
            }
            if let Some((_, page)) = pages.last_mut() {
                page[bit / 8] |= 1 << (bit % 8);
            }
        }

        let mut out = Vec::with_capacity(4 + pages.len() * (8 + PAGE_BYTES));
        out.write_u32::<LittleEndian>(pages.len() as u32)
            .map_err(|e| exchange_error(self.strategy(), e))?;
        for (index, page) in pages {
            out.write_u64::<LittleEndian>(index)
                .map_err(|e| exchange_error(self.strategy(), e))?;
            out.extend_from_slice(page.as_slice());
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u64>, EngineError> {
        let mut cursor = std::io::Cursor::new(bytes);
        let page_count = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| exchange_error(self.strategy(), e))? as usize;

        let mut units = Vec::new();
        let mut page = [0u8; PAGE_BYTES];
        for _ in 0..page_count {
            let index = cursor
                .read_u64::<LittleEndian>()
                .map_err(|e| exchange_error(self.strategy(), e))?;
            cursor
                .read_exact(&mut page)
                .map_err(|e| exchange_error(self.strategy(), e))?;
            let base = index.checked_mul(PAGE_SPAN).ok_or_else(|| {
                exchange_error(self.strategy(), format!("page index {index} out of range"))
            })?;
            for (byte_index, &byte) in page.iter().enumerate() {
                if byte == 0 {
                    continue;
                }
                for bit in 0..8 {
                    if byte & (1 << bit) != 0 {
                        units.push(base + (byte_index * 8 + bit) as u64);
                    }
                }
            }
        }
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;

    fn sample_frontiers() -> Vec<Vec<u64>> {
        vec![
            vec![],
            vec![42],
            vec![0, 1, 2, 3, 4, 5, 6, 7],
            // Sparse across several bitmap pages.
            vec![5, 70_000, 70_001, 1_000_000, 9_999_999],
            (0..5_000).map(|i| i * 3).collect(),
        ]
    }

    #[test]
    fn test_every_codec_round_trips_every_frontier() {
        let codecs: Vec<Box<dyn FrontierCodec>> = vec![
            Box::new(CompressedSingleCodec),
            Box::new(BoundedMultiCodec { max_blocks: 100 }),
            Box::new(FlatBitmapCodec),
        ];
        for codec in &codecs {
            for frontier in sample_frontiers() {
                let expected = normalize(frontier.clone());
                let bytes = codec.encode(&frontier).unwrap();
                let decoded = codec.decode(&bytes).unwrap();
                assert_eq!(decoded, expected, "strategy {}", codec.strategy());
            }
        }
    }

    #[test]
    fn test_high_unit_ids_survive_every_codec() {
        // Ids above 2^48 land on bitmap pages past the u32 range.
        let frontier = vec![5, 1 << 48, u64::MAX - 1, u64::MAX];
        let codecs: Vec<Box<dyn FrontierCodec>> = vec![
            Box::new(CompressedSingleCodec),
            Box::new(BoundedMultiCodec { max_blocks: 4 }),
            Box::new(FlatBitmapCodec),
        ];
        for codec in &codecs {
            let bytes = codec.encode(&frontier).unwrap();
            assert_eq!(
                codec.decode(&bytes).unwrap(),
                frontier,
                "strategy {}",
                codec.strategy()
            );
        }
    }

    #[test]
    fn test_encoders_deduplicate_and_sort() {
        let codec = CompressedSingleCodec;
        let bytes = codec.encode(&[9, 3, 9, 3, 1]).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), vec![1, 3, 9]);
    }

    #[test]
    fn test_bounded_multi_respects_block_bound() {
        let codec = BoundedMultiCodec { max_blocks: 4 };
        let frontier: Vec<u64> = (0..1_000).collect();
        let bytes = codec.encode(&frontier).unwrap();
        let block_count = std::io::Cursor::new(&bytes)
            .read_u32::<LittleEndian>()
            .unwrap();
        assert!(block_count <= 4);
        assert_eq!(codec.decode(&bytes).unwrap(), frontier);
    }

    #[test]
    fn test_strategy_names_round_trip() {
        for strategy in [
            CommStrategy::CompressedSingle,
            CommStrategy::BoundedMulti,
            CommStrategy::FlatBitmap,
        ] {
            assert_eq!(CommStrategy::parse(strategy.as_str()).unwrap(), strategy);
        }
        assert!(matches!(
            CommStrategy::parse("carrier_pigeon"),
            Err(EngineError::UnsupportedStrategy(_))
        ));
    }

    #[test]
    fn test_truncated_input_is_an_exchange_error() {
        let codec = CompressedSingleCodec;
        let mut bytes = codec.encode(&[1, 2, 3]).unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            codec.decode(&bytes),
            Err(EngineError::Exchange { .. })
        ));
    }

    #[test]
    fn test_routing_covers_all_partitions() {
        let hits: Vec<usize> = (0u64..8).map(|unit| route(unit, 4)).collect();
        assert_eq!(hits, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }
}
