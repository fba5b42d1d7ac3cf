//! Minimal ASAM MDF 4.10 writer.
//!
//! Produces a sorted file with two data groups: the extracted CAN frames
//! (master time, `CAN_ID`, `Data_Byte0..7`) and a single-sample summary group
//! (`Total_Tests`, `Success_Count`) at time zero. Blocks are built in memory
//! with links expressed as block indices, then laid out sequentially on
//! 8-byte boundaries and resolved to file offsets.

use crate::trace::{ExportSummary, TraceFrame};
use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{DateTime, Local};
use std::io::{self, Write};

const ID_BLOCK_SIZE: u64 = 64;
const BLOCK_HEADER_SIZE: u64 = 24;
const MDF_VERSION: u16 = 410;

const CN_TYPE_VALUE: u8 = 0;
const CN_TYPE_MASTER: u8 = 2;
const SYNC_NONE: u8 = 0;
const SYNC_TIME: u8 = 1;
const DT_UNSIGNED_LE: u8 = 0;
const DT_FLOAT_LE: u8 = 4;

/// Sample period of the synthetic time base, in seconds.
const SAMPLE_PERIOD_S: f64 = 0.001;
const PLACEHOLDER_ID: u32 = 0x100;

struct Block {
    id: &'static [u8; 4],
    links: Vec<Option<usize>>,
    data: Vec<u8>,
}

impl Block {
    fn len(&self) -> u64 {
        BLOCK_HEADER_SIZE + 8 * self.links.len() as u64 + self.data.len() as u64
    }
}

fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

#[derive(Default)]
struct Builder {
    blocks: Vec<Block>,
}

impl Builder {
    fn push(&mut self, id: &'static [u8; 4], links: usize, data: Vec<u8>) -> usize {
        self.blocks.push(Block {
            id,
            links: vec![None; links],
            data,
        });
        self.blocks.len() - 1
    }

    fn link(&mut self, from: usize, slot: usize, to: usize) {
        self.blocks[from].links[slot] = Some(to);
    }

    fn text(&mut self, id: &'static [u8; 4], text: &str) -> usize {
        let mut data = text.as_bytes().to_vec();
        data.push(0);
        data.resize(align8(data.len() as u64) as usize, 0);
        self.push(id, 0, data)
    }

    fn tx(&mut self, text: &str) -> usize {
        self.text(b"##TX", text)
    }

    fn md(&mut self, xml: &str) -> usize {
        self.text(b"##MD", xml)
    }

    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mut offsets = Vec::with_capacity(self.blocks.len());
        let mut cursor = ID_BLOCK_SIZE;
        for block in &self.blocks {
            offsets.push(cursor);
            cursor = align8(cursor + block.len());
        }

        write_id_block(out)?;
        let mut position = ID_BLOCK_SIZE;
        for (block, &offset) in self.blocks.iter().zip(&offsets) {
            for _ in position..offset {
                out.write_u8(0)?;
            }
            out.write_all(block.id)?;
            out.write_u32::<LittleEndian>(0)?;
            out.write_u64::<LittleEndian>(block.len())?;
            out.write_u64::<LittleEndian>(block.links.len() as u64)?;
            for link in &block.links {
                out.write_u64::<LittleEndian>(link.map_or(0, |i| offsets[i]))?;
            }
            out.write_all(&block.data)?;
            position = offset + block.len();
        }
        for _ in position..align8(position) {
            out.write_u8(0)?;
        }
        Ok(())
    }
}

fn write_id_block<W: Write>(out: &mut W) -> io::Result<()> {
    out.write_all(b"MDF     ")?;
    out.write_all(b"4.10    ")?;
    out.write_all(b"canfuzz ")?;
    out.write_all(&[0; 4])?;
    out.write_u16::<LittleEndian>(MDF_VERSION)?;
    out.write_all(&[0; 30])?;
    out.write_u16::<LittleEndian>(0)?;
    out.write_u16::<LittleEndian>(0)?;
    Ok(())
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn time_data(generated: DateTime<Local>, trailing: usize) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    let ns = generated.timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
    data.write_u64::<LittleEndian>(ns)?;
    data.write_i16::<LittleEndian>(0)?;
    data.write_i16::<LittleEndian>(0)?;
    // UTC time, no offsets.
    data.write_u8(0)?;
    data.resize(data.len() + trailing, 0);
    Ok(data)
}

struct ChannelSpec<'a> {
    name: &'a str,
    comment: &'a str,
    unit: Option<&'a str>,
    cn_type: u8,
    sync_type: u8,
    data_type: u8,
    byte_offset: u32,
    bit_count: u32,
}

impl ChannelSpec<'_> {
    fn master() -> Self {
        ChannelSpec {
            name: "t",
            comment: "Synthetic time base, one millisecond per frame",
            unit: Some("s"),
            cn_type: CN_TYPE_MASTER,
            sync_type: SYNC_TIME,
            data_type: DT_FLOAT_LE,
            byte_offset: 0,
            bit_count: 64,
        }
    }
}

fn channel_block(b: &mut Builder, channel: &ChannelSpec<'_>) -> io::Result<usize> {
    let mut data = Vec::with_capacity(72);
    data.write_u8(channel.cn_type)?;
    data.write_u8(channel.sync_type)?;
    data.write_u8(channel.data_type)?;
    data.write_u8(0)?; // bit offset
    data.write_u32::<LittleEndian>(channel.byte_offset)?;
    data.write_u32::<LittleEndian>(channel.bit_count)?;
    data.write_u32::<LittleEndian>(0)?; // flags
    data.write_u32::<LittleEndian>(0)?; // invalidation bit position
    data.write_u8(0)?; // precision
    data.write_u8(0)?;
    data.write_u16::<LittleEndian>(0)?; // attachments
    for _ in 0..6 {
        data.write_f64::<LittleEndian>(0.0)?;
    }

    let cn = b.push(b"##CN", 8, data);
    let name = b.tx(channel.name);
    b.link(cn, 2, name);
    if let Some(unit) = channel.unit {
        let unit = b.tx(unit);
        b.link(cn, 6, unit);
    }
    let comment = b.tx(channel.comment);
    b.link(cn, 7, comment);
    Ok(cn)
}

/// Adds a data group holding one channel group with the given channels and records.
fn data_group(
    b: &mut Builder,
    acq_name: &str,
    channels: &[ChannelSpec<'_>],
    record_size: u32,
    records: Vec<u8>,
) -> io::Result<usize> {
    let cycle_count = records.len() as u64 / u64::from(record_size);

    let mut dg_data = Vec::new();
    dg_data.write_u8(0)?; // record id size: sorted
    dg_data.resize(8, 0);
    let dg = b.push(b"##DG", 4, dg_data);

    let mut cg_data = Vec::new();
    cg_data.write_u64::<LittleEndian>(0)?; // record id
    cg_data.write_u64::<LittleEndian>(cycle_count)?;
    cg_data.write_u16::<LittleEndian>(0)?; // flags
    cg_data.write_u16::<LittleEndian>(0)?; // path separator
    cg_data.write_u32::<LittleEndian>(0)?;
    cg_data.write_u32::<LittleEndian>(record_size)?;
    cg_data.write_u32::<LittleEndian>(0)?; // invalidation bytes
    let cg = b.push(b"##CG", 6, cg_data);
    b.link(dg, 1, cg);
    let acq = b.tx(acq_name);
    b.link(cg, 2, acq);

    let mut previous: Option<usize> = None;
    for channel in channels {
        let cn = channel_block(b, channel)?;
        match previous {
            Some(prev) => b.link(prev, 0, cn),
            None => b.link(cg, 1, cn),
        }
        previous = Some(cn);
    }

    let dt = b.push(b"##DT", 0, records);
    b.link(dg, 2, dt);
    Ok(dg)
}

/// Writes `frames` and `summary` as an MDF4 file. Returns the number of frame
/// samples written; an empty frame list yields one all-zero placeholder.
pub fn write_mf4<W: Write>(
    out: &mut W,
    frames: &[TraceFrame],
    summary: ExportSummary,
    title: &str,
    generated: DateTime<Local>,
) -> io::Result<usize> {
    let mut b = Builder::default();

    let hd = b.push(b"##HD", 6, {
        let mut data = time_data(generated, 3)?;
        data.write_f64::<LittleEndian>(0.0)?; // start angle
        data.write_f64::<LittleEndian>(0.0)?; // start distance
        data
    });

    let hd_comment = b.md(&format!(
        "<HDcomment><TX>{}</TX></HDcomment>",
        xml_escape(&format!(
            "{title}\nGenerated: {}\nTotal tests: {}\nSuccessful tests: {}\nCAN frames: {}",
            generated.format("%Y-%m-%d %H:%M:%S"),
            summary.total_tests,
            summary.success_count,
            frames.len()
        ))
    ));
    b.link(hd, 5, hd_comment);

    let fh = b.push(b"##FH", 2, time_data(generated, 3)?);
    b.link(hd, 1, fh);
    let fh_comment = b.md(&format!(
        concat!(
            "<FHcomment><TX>{}</TX><tool_id>canfuzz</tool_id>",
            "<tool_vendor>canfuzz</tool_vendor><tool_version>{}</tool_version></FHcomment>",
        ),
        xml_escape(&format!(
            "Generated by canfuzz trace export at {}",
            generated.format("%Y-%m-%d %H:%M:%S")
        )),
        env!("CARGO_PKG_VERSION")
    ));
    b.link(fh, 1, fh_comment);

    let mut frame_records = Vec::with_capacity(frames.len().max(1) * 20);
    if frames.is_empty() {
        frame_records.write_f64::<LittleEndian>(0.0)?;
        frame_records.write_u32::<LittleEndian>(PLACEHOLDER_ID)?;
        frame_records.write_all(&[0; 8])?;
    } else {
        for (i, frame) in frames.iter().enumerate() {
            frame_records.write_f64::<LittleEndian>((i + 1) as f64 * SAMPLE_PERIOD_S)?;
            frame_records.write_u32::<LittleEndian>(frame.arbitration_id)?;
            frame_records.write_all(&frame.padded_data())?;
        }
    }
    let samples = frames.len().max(1);

    let byte_names: Vec<String> = (0..8).map(|i| format!("Data_Byte{i}")).collect();
    let byte_comments: Vec<String> = (0..8).map(|i| format!("CAN Data Byte {i}")).collect();
    let mut frame_channels = vec![
        ChannelSpec::master(),
        ChannelSpec {
            name: "CAN_ID",
            comment: "CAN Frame Identifier",
            unit: None,
            cn_type: CN_TYPE_VALUE,
            sync_type: SYNC_NONE,
            data_type: DT_UNSIGNED_LE,
            byte_offset: 8,
            bit_count: 32,
        },
    ];
    for (offset, (name, comment)) in (12u32..).zip(byte_names.iter().zip(&byte_comments)) {
        frame_channels.push(ChannelSpec {
            name,
            comment,
            unit: None,
            cn_type: CN_TYPE_VALUE,
            sync_type: SYNC_NONE,
            data_type: DT_UNSIGNED_LE,
            byte_offset: offset,
            bit_count: 8,
        });
    }
    let frames_dg = data_group(&mut b, "CAN frames", &frame_channels, 20, frame_records)?;
    b.link(hd, 0, frames_dg);

    let mut summary_record = Vec::with_capacity(16);
    summary_record.write_f64::<LittleEndian>(0.0)?;
    summary_record.write_u32::<LittleEndian>(summary.total_tests)?;
    summary_record.write_u32::<LittleEndian>(summary.success_count)?;
    let summary_channels = [
        ChannelSpec::master(),
        ChannelSpec {
            name: "Total_Tests",
            comment: "Total number of tests executed",
            unit: None,
            cn_type: CN_TYPE_VALUE,
            sync_type: SYNC_NONE,
            data_type: DT_UNSIGNED_LE,
            byte_offset: 8,
            bit_count: 32,
        },
        ChannelSpec {
            name: "Success_Count",
            comment: "Number of successful tests",
            unit: None,
            cn_type: CN_TYPE_VALUE,
            sync_type: SYNC_NONE,
            data_type: DT_UNSIGNED_LE,
            byte_offset: 12,
            bit_count: 32,
        },
    ];
    let summary_dg = data_group(&mut b, "Test summary", &summary_channels, 16, summary_record)?;
    b.link(frames_dg, 0, summary_dg);

    b.write(out)?;
    Ok(samples)
}
