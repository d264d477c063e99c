//! Outgoing report contents: reception report blocks and SDES rotation

use super::ntp::to_short_units;
use super::rtcp::{ReportBlock, SdesChunk, SdesItem, SdesItemType, HEADER_SIZE};
use super::source::{SourceDatabase, SourceEntry};
use std::time::Duration;

/// Largest magnitude a signed 24-bit cumulative loss can carry
const CUMULATIVE_LOST_MAX: i64 = 0x7F_FFFF;
const CUMULATIVE_LOST_MIN: i64 = -0x80_0000;

/// Reception report for one source, rolling its interval counters forward
pub fn report_block(entry: &mut SourceEntry, now: Duration) -> ReportBlock {
    let seq = &mut entry.sequence;

    let expected = seq.expected();
    let lost = seq.lost().clamp(CUMULATIVE_LOST_MIN, CUMULATIVE_LOST_MAX);

    let expected_interval = expected.wrapping_sub(seq.expected_prior);
    let received_interval = seq.received.wrapping_sub(seq.received_prior);
    seq.expected_prior = expected;
    seq.received_prior = seq.received;

    let lost_interval = expected_interval as i64 - received_interval as i64;
    let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
        0
    } else {
        ((lost_interval << 8) / expected_interval as i64).min(255) as u8
    };

    let (lsr, dlsr) = match entry.last_sr {
        Some(sr) => (
            sr.ntp.middle32(),
            to_short_units(now.saturating_sub(sr.received_at)),
        ),
        None => (0, 0),
    };

    ReportBlock {
        ssrc: entry.ssrc,
        fraction_lost,
        cumulative_lost: (lost as i32 as u32) & 0x00FF_FFFF,
        highest_seq: seq.extended_max(),
        jitter: entry.reported_jitter(),
        lsr,
        dlsr,
    }
}

/// Report blocks for every remote sender we have RTP from, ordered by SSRC
pub fn report_blocks(sources: &mut SourceDatabase, now: Duration) -> Vec<ReportBlock> {
    sources
        .sender_ssrcs()
        .into_iter()
        .filter_map(|ssrc| {
            let entry = sources.get_mut(ssrc)?;
            entry.sequence.primed.then(|| report_block(entry, now))
        })
        .collect()
}

/// Picks the SDES items sent with each report.
///
/// CNAME and NOTE go in every packet. Every third packet carries one more
/// item: NAME, except on every eighth such slot, which cycles through TOOL,
/// EMAIL, PHONE, LOC and PRIV.
#[derive(Debug, Clone, Default)]
pub struct SdesRotation {
    primary: u32,
    secondary: u32,
    ternary: u32,
}

impl SdesRotation {
    const TERNARY_ITEMS: [SdesItemType; 5] = [
        SdesItemType::Tool,
        SdesItemType::Email,
        SdesItemType::Phone,
        SdesItemType::Loc,
        SdesItemType::Priv,
    ];

    pub fn new() -> Self {
        Self::default()
    }

    /// Build the own chunk, skipping items that would push the SDES packet past `budget`
    pub fn next_chunk(&mut self, own: &SourceEntry, budget: usize) -> SdesChunk {
        let mut chunk = SdesChunk::new(own.ssrc);

        if let Some(cname) = own.cname() {
            chunk = chunk.with_item(SdesItem::new(SdesItemType::Cname, cname));
        }
        chunk = add_if_fits(chunk, own, SdesItemType::Note, budget);

        if self.primary % 3 == 0 {
            self.secondary += 1;
            if self.secondary % 8 == 0 {
                let kind = Self::TERNARY_ITEMS[(self.ternary % 5) as usize];
                chunk = add_if_fits(chunk, own, kind, budget);
                self.ternary += 1;
            } else {
                chunk = add_if_fits(chunk, own, SdesItemType::Name, budget);
            }
        }
        self.primary += 1;

        chunk
    }
}

fn add_if_fits(chunk: SdesChunk, own: &SourceEntry, kind: SdesItemType, budget: usize) -> SdesChunk {
    let Some(text) = own.sdes.get(&kind) else {
        return chunk;
    };
    let candidate = chunk.clone().with_item(SdesItem::new(kind, text.as_str()));
    if HEADER_SIZE + candidate.size() <= budget {
        candidate
    } else {
        chunk
    }
}
