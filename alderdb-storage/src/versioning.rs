//! Versioning policies.
//!
//! A record page is persisted as a chain of fragments; reconstructing the
//! full page overlays fragments newest first into an empty slot table. A
//! slot once filled is never overwritten, and a tombstone fills its slot
//! so older revisions cannot shine through. The policy decides how many
//! fragments a chain may grow before a complete snapshot is written
//! again, and which slots a commit must carry forward.

use crate::page::RecordPage;
use crate::record::Node;
use crate::reference::TreeKind;
use crate::{Error, RECORDS_PER_PAGE, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Versioning {
    /// Every commit writes the complete page.
    Full,
    /// One delta against the last full snapshot.
    Differential,
    /// A delta per commit, full snapshot every `revs_to_restore` commits.
    Incremental,
    /// A delta per commit; slots about to leave the window are carried
    /// forward so at most `revs_to_restore` fragments are ever needed.
    SlidingSnapshot,
}

impl Versioning {
    /// Revisions a reader consults to reconstruct a page at `current`,
    /// newest first. Full-dump revisions are the multiples of
    /// `revs_to_restore`; revision 0 is always a full dump.
    pub fn revisions_to_read(self, current: u32, revs_to_restore: u32) -> Vec<u32> {
        let rtr = revs_to_restore.max(1);
        let last_full = current - current % rtr;
        match self {
            Versioning::Full => vec![current],
            Versioning::Differential => {
                if current == last_full {
                    vec![current]
                } else {
                    vec![current, last_full]
                }
            }
            Versioning::Incremental => (last_full..=current).rev().collect(),
            Versioning::SlidingSnapshot => {
                let start = current.saturating_sub(rtr - 1);
                (start..=current).rev().collect()
            }
        }
    }

    /// Upper bound on the fragment chain a reader walks.
    pub fn fragment_budget(self, revs_to_restore: u32) -> usize {
        match self {
            Versioning::Full => 1,
            Versioning::Differential => 2,
            Versioning::Incremental | Versioning::SlidingSnapshot => {
                revs_to_restore.max(1) as usize
            }
        }
    }

    /// Reconstructs the complete page from a fragment chain, newest
    /// first. Each element pairs the fragment with its storage key.
    pub fn combine(self, fragments: &[(u64, &RecordPage)], revs_to_restore: u32) -> Result<RecordPage> {
        let overlay = overlay(fragments, self.fragment_budget(revs_to_restore))?;
        let (_, newest) = fragments[0];
        Ok(RecordPage {
            tree: newest.tree,
            page_key: newest.page_key,
            revision: newest.revision,
            full: true,
            previous: None,
            slots: overlay.slots,
        })
    }
}

struct Overlay {
    slots: BTreeMap<u16, Node>,
    /// Fragment index that provided each slot.
    provenance: BTreeMap<u16, usize>,
    /// Index of the full fragment that terminated the walk, if any.
    full_at: Option<usize>,
    /// Fragments consumed.
    used: usize,
}

fn overlay(fragments: &[(u64, &RecordPage)], budget: usize) -> Result<Overlay> {
    let (_, newest) = fragments
        .first()
        .ok_or(Error::Versioning("no fragments to combine"))?;
    let mut slots: BTreeMap<u16, Node> = BTreeMap::new();
    let mut provenance = BTreeMap::new();
    let mut full_at = None;
    let mut used = 0;
    let mut last_revision = newest.revision;

    for (i, (_, fragment)) in fragments.iter().take(budget).enumerate() {
        if fragment.tree != newest.tree || fragment.page_key != newest.page_key {
            return Err(Error::Versioning("fragment belongs to a different page"));
        }
        if fragment.revision > last_revision {
            return Err(Error::Versioning("fragments not ordered newest first"));
        }
        last_revision = fragment.revision;
        used = i + 1;

        for (offset, node) in &fragment.slots {
            // First fragment to cover a slot wins; a tombstone covers it
            // explicitly so nothing older falls through.
            if !slots.contains_key(offset) {
                slots.insert(*offset, node.clone());
                provenance.insert(*offset, i);
            }
        }

        if fragment.full {
            full_at = Some(i);
            break;
        }
        if slots.len() == RECORDS_PER_PAGE {
            break;
        }
    }

    Ok(Overlay {
        slots,
        provenance,
        full_at,
        used,
    })
}

/// Write-transaction view of one record page: the reconstructed complete
/// page plus everything needed to emit the policy's delta at commit.
#[derive(Debug, Clone)]
pub struct RecordPageContainer {
    pub complete: RecordPage,
    dirty: BTreeSet<u16>,
    /// Slots provided by fragments newer than the terminating full dump.
    delta_slots: BTreeSet<u16>,
    /// Slots whose only provider is about to slide out of the window.
    oldest_only: BTreeSet<u16>,
    newest_key: Option<u64>,
    base_full_key: Option<u64>,
    /// The chain hit its budget without a terminating full dump.
    force_full_dump: bool,
}

impl RecordPageContainer {
    /// Container for a page that has no persisted fragments yet.
    pub fn new_empty(tree: TreeKind, page_key: u64, revision: u32) -> Self {
        Self {
            complete: RecordPage::new(tree, page_key, revision),
            dirty: BTreeSet::new(),
            delta_slots: BTreeSet::new(),
            oldest_only: BTreeSet::new(),
            newest_key: None,
            base_full_key: None,
            force_full_dump: false,
        }
    }

    /// Builds the complete view for modification at `new_revision`.
    pub fn from_fragments(
        policy: Versioning,
        fragments: &[(u64, &RecordPage)],
        new_revision: u32,
        revs_to_restore: u32,
    ) -> Result<Self> {
        let budget = policy.fragment_budget(revs_to_restore);
        let ov = overlay(fragments, budget)?;
        let (newest_key, newest) = (fragments[0].0, fragments[0].1);

        let delta_slots = ov
            .provenance
            .iter()
            .filter(|&(_, &i)| ov.full_at != Some(i))
            .map(|(&off, _)| off)
            .collect();
        let window_full = ov.used == budget;
        let oldest_only = if window_full {
            ov.provenance
                .iter()
                .filter(|&(_, &i)| i == ov.used - 1)
                .map(|(&off, _)| off)
                .collect()
        } else {
            BTreeSet::new()
        };
        let base_full_key = ov.full_at.map(|i| fragments[i].0);

        Ok(Self {
            complete: RecordPage {
                tree: newest.tree,
                page_key: newest.page_key,
                revision: new_revision,
                full: true,
                previous: None,
                slots: ov.slots,
            },
            dirty: BTreeSet::new(),
            delta_slots,
            oldest_only,
            newest_key: Some(newest_key),
            base_full_key,
            force_full_dump: ov.full_at.is_none() && window_full,
        })
    }

    pub fn get(&self, offset: u16) -> Option<&Node> {
        self.complete.get(offset)
    }

    pub fn put(&mut self, offset: u16, node: Node) {
        self.complete.set(offset, node);
        self.dirty.insert(offset);
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// The fragment this commit persists.
    pub fn modified_page(&self, policy: Versioning, revs_to_restore: u32) -> RecordPage {
        let rtr = revs_to_restore.max(1);
        let revision = self.complete.revision;
        let full_dump = match policy {
            Versioning::Full => true,
            Versioning::Differential | Versioning::Incremental => {
                self.newest_key.is_none() || revision % rtr == 0 || self.force_full_dump
            }
            Versioning::SlidingSnapshot => self.newest_key.is_none(),
        };

        if full_dump {
            let mut page = RecordPage::new(self.complete.tree, self.complete.page_key, revision);
            page.full = true;
            for (offset, node) in self.complete.live() {
                page.slots.insert(*offset, node.clone());
            }
            return page;
        }

        let wanted: BTreeSet<u16> = match policy {
            Versioning::Full => unreachable!(),
            Versioning::Differential => self.dirty.union(&self.delta_slots).copied().collect(),
            Versioning::Incremental => self.dirty.clone(),
            Versioning::SlidingSnapshot => self.dirty.union(&self.oldest_only).copied().collect(),
        };

        let mut page = RecordPage::new(self.complete.tree, self.complete.page_key, revision);
        page.previous = match policy {
            Versioning::Differential => self.base_full_key,
            _ => self.newest_key,
        };
        for offset in wanted {
            if let Some(node) = self.complete.get(offset) {
                page.slots.insert(offset, node.clone());
            }
        }
        page
    }
}
