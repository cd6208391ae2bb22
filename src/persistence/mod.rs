//! Persistence layer for saving and loading indexes.
//!
//! # File format
//!
//! ```text
//! [MAGIC 8B "QUIVRANN"][VERSION u32][SECTION u32][FLAGS u32][CHECKSUM u32]
//! [DATA section...]
//! ```
//!
//! The checksum is a CRC32 over the data section. For a full HNSW index the
//! data section holds the index options, the label table, the serialized
//! flatten cell, the per-node levels with the upper-layer adjacency, the
//! entry point, and finally the layer-0 graph snapshot in the builder's
//! wire layout. Edge distances are not persisted; they are rescored against
//! the corpus on load.

mod format;

pub use format::{FileHeader, SectionType, FORMAT_VERSION, MAGIC};

use crate::config::{Encoding, IndexOptions, Metric};
use crate::error::{QuiverError, Result};
use crate::flatten::FlattenCell;
use crate::graph::GraphStore;
use crate::index::HnswIndex;
use crate::types::{InnerId, LabelId};
use std::io::{Read, Write};
use std::path::Path;

/// Trait for types that can be persisted to disk.
pub trait Persistable: Sized {
    /// Save to a file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written or serialization
    /// fails.
    fn save(&self, path: impl AsRef<Path>) -> Result<()>;

    /// Load from a file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is corrupted, or has an
    /// incompatible format.
    fn load(path: impl AsRef<Path>) -> Result<Self>;
}

/// Verify the file header and checksum, returning the data section.
pub(crate) fn verify_header(data: &[u8], expected: SectionType) -> Result<&[u8]> {
    if data.len() < FileHeader::SIZE {
        return Err(QuiverError::corrupt("file too small for header"));
    }
    let header = FileHeader::from_bytes(&data[..FileHeader::SIZE])?;
    header.verify(expected)?;

    let section = &data[FileHeader::SIZE..];
    if crc32fast::hash(section) != header.checksum {
        return Err(QuiverError::ChecksumMismatch);
    }
    Ok(section)
}

/// Write a header plus data section to a file.
pub(crate) fn write_with_header(
    path: impl AsRef<Path>,
    section: SectionType,
    data: &[u8],
) -> Result<()> {
    let header = FileHeader::new(section, crc32fast::hash(data));
    let mut file = std::fs::File::create(path)?;
    file.write_all(&header.to_bytes())?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn metric_tag(metric: Metric) -> u8 {
    match metric {
        Metric::L2 => 0,
        Metric::Ip => 1,
        Metric::Cosine => 2,
    }
}

fn encoding_tag(encoding: Encoding) -> u8 {
    match encoding {
        Encoding::Fp32 => 0,
        Encoding::Bf16 => 1,
        Encoding::Sq8 => 2,
        Encoding::Sq4 => 3,
        Encoding::Sq4Uniform => 4,
        Encoding::Sq8Uniform => 5,
    }
}

fn write_index_payload(index: &HnswIndex, out: &mut Vec<u8>) -> Result<()> {
    let opts = index.options();
    write_u32(out, opts.dim as u32)?;
    out.push(metric_tag(opts.metric));
    out.push(encoding_tag(opts.encoding));
    write_u32(out, opts.max_degree as u32)?;
    write_u32(out, opts.ef_construction as u32)?;
    out.write_all(&opts.alpha.to_le_bytes())?;
    write_u64(out, opts.block_size)?;

    let labels = index.labels();
    write_u64(out, labels.len() as u64)?;
    for label in labels {
        write_u64(out, label.as_u64())?;
    }

    index.cell().serialize(out)?;

    let levels = index.node_levels();
    for (i, &level) in levels.iter().enumerate() {
        write_u32(out, level as u32)?;
        for layer in index.upper_links(InnerId::new(i as u32)) {
            write_u32(out, layer.len() as u32)?;
            for id in layer {
                write_u32(out, id.as_u32())?;
            }
        }
    }

    match index.entry_for_serialization() {
        Some((ep, level)) => {
            out.push(1);
            write_u32(out, ep.as_u32())?;
            write_u32(out, level as u32)?;
        }
        None => out.push(0),
    }

    index.to_graph_store().write_snapshot(out)?;
    Ok(())
}

fn read_index_payload(mut data: &[u8]) -> Result<HnswIndex> {
    let reader = &mut data;

    let dim = read_u32(reader)? as usize;
    let mut tags = [0u8; 2];
    reader.read_exact(&mut tags)?;
    let metric = match tags[0] {
        0 => Metric::L2,
        1 => Metric::Ip,
        2 => Metric::Cosine,
        t => return Err(QuiverError::corrupt(format!("unknown metric tag {t}"))),
    };
    let encoding = match tags[1] {
        0 => Encoding::Fp32,
        1 => Encoding::Bf16,
        2 => Encoding::Sq8,
        3 => Encoding::Sq4,
        4 => Encoding::Sq4Uniform,
        5 => Encoding::Sq8Uniform,
        t => return Err(QuiverError::corrupt(format!("unknown encoding tag {t}"))),
    };
    let max_degree = read_u32(reader)? as usize;
    let ef_construction = read_u32(reader)? as usize;
    let mut f32_buf = [0u8; 4];
    reader.read_exact(&mut f32_buf)?;
    let alpha = f32::from_le_bytes(f32_buf);
    let block_size = read_u64(reader)?;

    let opts = IndexOptions {
        dim,
        metric,
        encoding,
        max_degree,
        ef_construction,
        alpha,
        block_size,
    };
    opts.validate()
        .map_err(|e| QuiverError::corrupt(format!("bad saved options: {e}")))?;

    let n = read_u64(reader)? as usize;
    let mut labels = Vec::with_capacity(n);
    for _ in 0..n {
        labels.push(LabelId::new(read_u64(reader)?));
    }

    let cell = FlattenCell::deserialize(reader)?;
    if cell.len() != n || cell.dim() != dim || cell.encoding() != encoding || cell.metric() != metric
    {
        return Err(QuiverError::corrupt("flatten cell disagrees with options"));
    }

    let mut levels = Vec::with_capacity(n);
    let mut upper: Vec<Vec<Vec<InnerId>>> = Vec::with_capacity(n);
    for _ in 0..n {
        let level = read_u32(reader)? as usize;
        let mut layers = Vec::with_capacity(level);
        for _ in 0..level {
            let k = read_u32(reader)? as usize;
            if k > max_degree {
                return Err(QuiverError::corrupt("upper layer degree exceeds cap"));
            }
            let mut ids = Vec::with_capacity(k);
            for _ in 0..k {
                ids.push(InnerId::new(read_u32(reader)?));
            }
            layers.push(ids);
        }
        levels.push(level);
        upper.push(layers);
    }

    let mut entry_flag = [0u8; 1];
    reader.read_exact(&mut entry_flag)?;
    let entry = if entry_flag[0] == 1 {
        let ep = InnerId::new(read_u32(reader)?);
        let level = read_u32(reader)? as usize;
        Some((ep, level))
    } else {
        None
    };

    let layer0 = GraphStore::read_snapshot(reader)?;
    if layer0.len() != n {
        return Err(QuiverError::corrupt("layer-0 snapshot disagrees on size"));
    }

    let adjacency: Vec<Vec<Vec<InnerId>>> = (0..n)
        .map(|i| {
            let mut per_level = Vec::with_capacity(levels[i] + 1);
            per_level.push(
                layer0
                    .node(InnerId::new(i as u32))
                    .as_slice()
                    .iter()
                    .map(|nb| nb.id)
                    .collect(),
            );
            per_level.extend(upper[i].iter().cloned());
            per_level
        })
        .collect();

    HnswIndex::assemble(opts, cell, labels, levels, adjacency, entry)
}

impl Persistable for HnswIndex {
    fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut payload = Vec::new();
        write_index_payload(self, &mut payload)?;
        write_with_header(path, SectionType::HnswIndex, &payload)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        let payload = verify_header(&data, SectionType::HnswIndex)?;
        read_index_payload(payload)
    }
}
