// src/core/scheduler.rs

//! Two-tier admission control and fair dispatch of downloads (spec §4.2).
//!
//! Every dispatch round visits *feeds* (not sources) in a freshly shuffled
//! order, in repeated passes that each claim at most one `Waiting` location
//! per feed, so two feeds sharing one source's slot budget take turns
//! instead of one draining the other's budget first. Passes continue until
//! a full pass claims nothing (a fixed point) or the global slot budget is
//! exhausted. Per-source rate limiting is not applied here: a source's
//! token bucket is consumed by the download worker immediately before it
//! issues the HTTP request, not at scheduling time.

use std::collections::HashMap;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::core::catalogue::Catalogue;
use crate::core::model::LocationState;

/// One location claimed for download this dispatch round.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub source_id: i64,
    pub feed_id: i64,
    pub url: url::Url,
    pub hash: Option<String>,
    pub signature: Option<String>,
}

/// Global and per-source slot bookkeeping. Owned by the manager task; never
/// shared, so plain `u32` counters suffice.
pub struct Scheduler {
    pub global_slots: u32,
    pub default_slots_per_source: u32,
    used_slots: u32,
}

impl Scheduler {
    pub fn new(global_slots: u32, default_slots_per_source: u32) -> Self {
        Scheduler {
            global_slots,
            default_slots_per_source,
            used_slots: 0,
        }
    }

    pub fn available_global_slots(&self) -> u32 {
        self.global_slots.saturating_sub(self.used_slots)
    }

    pub fn used_slots(&self) -> u32 {
        self.used_slots
    }

    /// Claims as many waiting locations as budgets allow this round.
    pub fn dispatch(&mut self, catalogue: &mut Catalogue) -> Vec<DownloadJob> {
        let mut jobs = Vec::new();
        if self.available_global_slots() == 0 {
            return jobs;
        }

        let mut available_per_source: HashMap<i64, u32> = catalogue
            .sources()
            .filter(|s| s.active)
            .map(|s| {
                let cap = s.effective_slot_cap(self.default_slots_per_source, self.global_slots);
                (s.id, cap.saturating_sub(s.used_slots))
            })
            .collect();

        let mut feed_ids: Vec<(i64, i64)> = catalogue
            .sources()
            .filter(|s| s.active)
            .flat_map(|s| s.feeds.iter().filter(|f| !f.atomics.is_invalid()).map(move |f| (s.id, f.id)))
            .collect();
        let mut rng = SmallRng::from_entropy();
        feed_ids.shuffle(&mut rng);

        let mut claimed_per_source: HashMap<i64, u32> = HashMap::new();

        loop {
            if self.available_global_slots() == 0 {
                break;
            }
            let mut claimed_this_pass = false;
            for &(source_id, feed_id) in &feed_ids {
                if self.available_global_slots() == 0 {
                    break;
                }
                let Some(available) = available_per_source.get_mut(&source_id) else {
                    continue;
                };
                if *available == 0 {
                    continue;
                }
                let Ok(feed) = catalogue.feed_mut(source_id, feed_id) else {
                    continue;
                };
                let Some(pos) = feed.queue.iter().position(|l| l.state == LocationState::Waiting) else {
                    continue;
                };
                let location = &mut feed.queue[pos];
                location.state = LocationState::Running;
                jobs.push(DownloadJob {
                    source_id,
                    feed_id,
                    url: location.url.clone(),
                    hash: location.hash.clone(),
                    signature: location.signature.clone(),
                });
                *available -= 1;
                self.used_slots += 1;
                *claimed_per_source.entry(source_id).or_insert(0) += 1;
                claimed_this_pass = true;
            }
            if !claimed_this_pass {
                break;
            }
        }

        for (source_id, claimed) in claimed_per_source {
            if let Ok(source) = catalogue.source_mut(source_id) {
                source.used_slots += claimed;
            }
        }
        jobs
    }

    /// Releases a slot claimed by a job that has finished, successfully or
    /// not (spec §4.2).
    pub fn release_slot(&mut self, catalogue: &mut Catalogue, source_id: i64) {
        self.used_slots = self.used_slots.saturating_sub(1);
        if let Ok(source) = catalogue.source_mut(source_id) {
            source.used_slots = source.used_slots.saturating_sub(1);
        }
    }
}
