//! GTID identifiers and GTID set algebra
//!
//! A [`Gtid`] names one transaction as `uuid:gno` (128-bit source id plus a
//! positive, per-source monotonically increasing number). A [`GtidSet`] maps
//! each source uuid to an ordered list of half-open `[start, stop)` gno
//! intervals, kept sorted, non-overlapping, and coalesced.
//!
//! Text grammar (MySQL `gtid_executed` style, inclusive range bounds):
//!
//! ```text
//! set      := uuid_set { ',' uuid_set }
//! uuid_set := uuid (':' interval)+
//! interval := gno | lo '-' hi        (gno >= 1, lo <= hi)
//! ```
//!
//! Parsing canonicalizes; serializing canonical input reproduces it exactly.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

/// GTID text parsing failures. Non-fatal, per-message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GtidError {
    /// The text does not match the GTID grammar
    #[error("invalid GTID syntax: {0}")]
    Syntax(String),
}

impl GtidError {
    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::Syntax(msg.into())
    }
}

/// A single global transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gtid {
    /// Source server uuid
    pub sid: Uuid,
    /// Transaction number within the source, >= 1
    pub gno: u64,
}

impl Gtid {
    pub fn new(sid: Uuid, gno: u64) -> Self {
        debug_assert!(gno >= 1, "gno must be >= 1");
        Self { sid, gno }
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sid, self.gno)
    }
}

impl FromStr for Gtid {
    type Err = GtidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sid, gno) = s
            .split_once(':')
            .ok_or_else(|| GtidError::syntax(format!("missing ':' in {s:?}")))?;
        let sid = Uuid::parse_str(sid.trim())
            .map_err(|e| GtidError::syntax(format!("bad uuid in {s:?}: {e}")))?;
        let gno = parse_gno(gno.trim())?;
        Ok(Self { sid, gno })
    }
}

/// A half-open interval `[start, stop)` over gno space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: u64,
    pub stop: u64,
}

impl Interval {
    /// The single-point interval `[gno, gno+1)`.
    pub fn point(gno: u64) -> Self {
        Self {
            start: gno,
            stop: gno + 1,
        }
    }
}

/// A set of GTIDs: per-uuid sorted, coalesced interval lists.
///
/// `BTreeMap` iteration over `Uuid` keys matches the lexicographic order of
/// their canonical hex text, so serialization is canonical without extra
/// sorting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet {
    sets: BTreeMap<Uuid, Vec<Interval>>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Total number of gnos covered, across all uuids.
    pub fn gno_count(&self) -> u64 {
        self.sets
            .values()
            .flatten()
            .map(|iv| iv.stop - iv.start)
            .sum()
    }

    /// Add the single gno `[gno, gno+1)` for `sid`, coalescing with adjacent
    /// or overlapping intervals. Adding twice is a no-op.
    pub fn add(&mut self, sid: Uuid, gno: u64) {
        self.add_interval(sid, Interval::point(gno));
    }

    /// Add one committed GTID.
    pub fn add_gtid(&mut self, gtid: &Gtid) {
        self.add(gtid.sid, gtid.gno);
    }

    /// Merge every interval of `other` into `self`.
    pub fn merge(&mut self, other: &GtidSet) {
        for (sid, intervals) in &other.sets {
            for iv in intervals {
                self.add_interval(*sid, *iv);
            }
        }
    }

    pub fn contains(&self, gtid: &Gtid) -> bool {
        self.sets.get(&gtid.sid).is_some_and(|ivs| {
            ivs.iter()
                .any(|iv| iv.start <= gtid.gno && gtid.gno < iv.stop)
        })
    }

    fn add_interval(&mut self, sid: Uuid, new: Interval) {
        let intervals = self.sets.entry(sid).or_default();

        // Slice of existing intervals that overlap or touch the new one;
        // half-open adjacency (stop == start) coalesces.
        let lo = intervals.partition_point(|iv| iv.stop < new.start);
        let mut merged = new;
        let mut hi = lo;
        while hi < intervals.len() && intervals[hi].start <= merged.stop {
            merged.start = merged.start.min(intervals[hi].start);
            merged.stop = merged.stop.max(intervals[hi].stop);
            hi += 1;
        }
        intervals.splice(lo..hi, [merged]);
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (sid, intervals)) in self.sets.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{sid}")?;
            for iv in intervals {
                if iv.stop == iv.start + 1 {
                    write!(f, ":{}", iv.start)?;
                } else {
                    write!(f, ":{}-{}", iv.start, iv.stop - 1)?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = GtidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = GtidSet::new();
        let s = s.trim();
        if s.is_empty() {
            return Ok(set);
        }

        for uuid_set in s.split(',') {
            let mut pieces = uuid_set.trim().split(':');
            let sid = pieces.next().unwrap_or_default();
            let sid = Uuid::parse_str(sid)
                .map_err(|e| GtidError::syntax(format!("bad uuid {sid:?}: {e}")))?;

            let mut any = false;
            for piece in pieces {
                set.add_interval(sid, parse_interval(piece)?);
                any = true;
            }
            if !any {
                return Err(GtidError::syntax(format!("uuid {sid} carries no intervals")));
            }
        }
        Ok(set)
    }
}

fn parse_interval(s: &str) -> Result<Interval, GtidError> {
    match s.split_once('-') {
        None => Ok(Interval::point(parse_gno(s)?)),
        Some((lo, hi)) => {
            let lo = parse_gno(lo)?;
            let hi = parse_gno(hi)?;
            if lo > hi {
                return Err(GtidError::syntax(format!("descending interval {lo}-{hi}")));
            }
            Ok(Interval {
                start: lo,
                stop: hi + 1,
            })
        }
    }
}

fn parse_gno(s: &str) -> Result<u64, GtidError> {
    let gno: u64 = s
        .parse()
        .map_err(|_| GtidError::syntax(format!("bad gno {s:?}")))?;
    if gno == 0 {
        return Err(GtidError::syntax("gno must be >= 1".to_string()));
    }
    Ok(gno)
}
