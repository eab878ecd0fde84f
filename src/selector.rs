//! Picks one T1w image per session when several acquisitions exist.
//!
//! Candidates are bucketed by an ordered rule table and the first non-empty bucket wins.
//! Inside the bucket the highest run number wins; equal run numbers keep the candidate that
//! came first in the input.

use tracing::debug;

use crate::bids::{BidsImage, Entities};
use crate::error::{PipelineError, Result};

/// anything that carries BIDS entities can be selected from
pub trait Candidate {
    fn entities(&self) -> &Entities;
}

impl Candidate for BidsImage {
    fn entities(&self) -> &Entities {
        BidsImage::entities(self)
    }
}

impl Candidate for Entities {
    fn entities(&self) -> &Entities {
        self
    }
}

/// selection buckets, in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityClass {
    VnavPass,
    VnavMoco,
    RecNorm,
    AcqSag,
    Other,
}

type Rule = (PriorityClass, fn(&Entities) -> bool);

fn is_vnavpass(e: &Entities) -> bool {
    e.acquisition() == Some("vnavpass")
}

fn is_vnavmoco(e: &Entities) -> bool {
    e.acquisition() == Some("vnavmoco")
}

fn is_rec_norm(e: &Entities) -> bool {
    e.reconstruction() == Some("norm")
}

fn is_acq_sag(e: &Entities) -> bool {
    e.acquisition() == Some("sag")
}

fn any(_: &Entities) -> bool {
    true
}

/// evaluated top to bottom, the first matching rule assigns the bucket
pub const PRIORITY_RULES: [Rule; 5] = [
    (PriorityClass::VnavPass, is_vnavpass),
    (PriorityClass::VnavMoco, is_vnavmoco),
    (PriorityClass::RecNorm, is_rec_norm),
    (PriorityClass::AcqSag, is_acq_sag),
    (PriorityClass::Other, any),
];

pub fn classify(entities: &Entities) -> PriorityClass {
    PRIORITY_RULES
        .iter()
        .find(|(_, rule)| rule(entities))
        .map(|(class, _)| *class)
        .unwrap_or(PriorityClass::Other)
}

/// returns the best candidate of a non-empty list
pub fn select_best<C: Candidate>(candidates: &[C]) -> Result<&C> {
    match candidates {
        [] => Err(PipelineError::EmptyInput),
        [only] => Ok(only),
        _ => {
            for (class, _) in PRIORITY_RULES.iter() {
                let bucket = candidates
                    .iter()
                    .filter(|c| classify(c.entities()) == *class)
                    .collect::<Vec<_>>();
                if let Some(best) = last_run(&bucket) {
                    debug!("selected from {:?} bucket of {} candidates", class, bucket.len());
                    return Ok(best);
                }
            }
            // the last rule matches everything, so some bucket is always non-empty
            Err(PipelineError::EmptyInput)
        }
    }
}

/// highest run number, first-seen on ties
fn last_run<'a, C: Candidate>(bucket: &[&'a C]) -> Option<&'a C> {
    if let [only] = bucket {
        return Some(*only);
    }
    let mut best: Option<(&'a C, u32)> = None;
    for &c in bucket {
        let run = c.entities().run();
        if best.map_or(true, |(_, max_run)| run > max_run) {
            best = Some((c, run));
        }
    }
    best.map(|(c, _)| c)
}
