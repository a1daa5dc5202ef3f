//! Ranked list of (primary, secondary) times for splits and placings

use crate::tod::{TimeValue, Tod};
use std::ops::Index;

/// Placeholder results, in order, each one microsecond after the last.
/// The first three sort ahead of any real time, the rest after.
const SPECIAL: [(&str, &str, bool); 12] = [
    ("catch", "catch", false),
    ("win", "catch", false),
    ("w/o", "w/o", false),
    ("max", "max", true),
    ("caught", "caught", true),
    ("lose", "caught", true),
    ("rel", "rel", true),
    ("otl", "otl", true),
    ("dnf", "dnf", true),
    ("abd", "abd", true),
    ("dns", "dns", true),
    ("dsq", "dsq", true),
];

/// Sortable stand-in time for a placeholder result such as `dnf`
pub fn special(name: &str) -> Option<Tod> {
    let (i, (_, chan, last)) = SPECIAL.iter().enumerate().find(|(_, (n, _, _))| *n == name)?;
    let base = if *last { Tod::MAX.micros() } else { 0 };
    let t = Tod::from_micros(base + i as i64 + 1).ok()?;
    Some(t.tagged("", chan, "", ""))
}

/// Times kept in order of (primary, secondary)
///
/// Each entry records the competitor number in `refid` and the series in
/// `index`, and carries the list label as its channel.
#[derive(Clone, Debug, Default)]
pub struct TodList {
    label: String,
    store: Vec<(Tod, Tod)>,
}

impl TodList {
    pub fn new(label: &str) -> TodList {
        TodList {
            label: label.to_string(),
            store: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (Tod, Tod)> {
        self.store.iter()
    }

    pub fn clear(&mut self) {
        self.store.clear();
    }

    /// Insert ahead of any entry with equal times, return the position
    ///
    /// `bib` defaults to the index of `pri`, `sec` to zero.
    pub fn insert(
        &mut self,
        pri: &Tod,
        sec: Option<&Tod>,
        bib: Option<&str>,
        series: &str,
    ) -> usize {
        let bib = bib.unwrap_or(pri.index.as_str()).to_string();
        let rt0 = pri.clone().tagged(series, &self.label, &bib, "");
        let rt1 = sec
            .unwrap_or(&Tod::ZERO)
            .clone()
            .tagged(series, &self.label, &bib, "");
        let pos = self.store.partition_point(|(p, s)| (p, s) < (&rt0, &rt1));
        self.store.insert(pos, (rt0, rt1));
        pos
    }

    /// Insert a placeholder result by name, `None` if the name is unknown
    pub fn insert_special(&mut self, name: &str, bib: &str, series: &str) -> Option<usize> {
        let t = special(name)?;
        Some(self.insert(&t, None, Some(bib), series))
    }

    /// Remove entries for `bib` in `series`, only the first if `once`
    ///
    /// Returns the number of entries removed.
    pub fn remove(&mut self, bib: &str, series: &str, once: bool) -> usize {
        let mut removed = 0;
        self.store.retain(|(p, _)| {
            let hit = p.refid == bib && p.index == series && !(once && removed > 0);
            if hit {
                removed += 1;
            }
            !hit
        });
        removed
    }

    /// Zero based placing of `bib` in `series`, equal times share a place
    pub fn rank(&self, bib: &str, series: &str) -> Option<usize> {
        let mut place = 0;
        let mut last: Option<&(Tod, Tod)> = None;
        for (count, lt) in self.store.iter().enumerate() {
            if let Some((lp, ls)) = last {
                if lt.0 != *lp || lt.1 != *ls {
                    place = count;
                }
            }
            if lt.0.refid == bib && lt.0.index == series {
                return Some(place);
            }
            last = Some(lt);
        }
        None
    }

    /// Renumber `oldno` in `oldseries` as `newno` in `newseries`
    pub fn changeno(&mut self, oldno: &str, newno: &str, oldseries: &str, newseries: &str) {
        for (p, _) in self.store.iter_mut() {
            if p.refid == oldno && p.index == oldseries {
                p.refid = newno.to_string();
                p.index = newseries.to_string();
            }
        }
    }
}

impl Index<usize> for TodList {
    type Output = (Tod, Tod);

    fn index(&self, i: usize) -> &(Tod, Tod) {
        &self.store[i]
    }
}

impl<'a> IntoIterator for &'a TodList {
    type Item = &'a (Tod, Tod);
    type IntoIter = std::slice::Iter<'a, (Tod, Tod)>;

    fn into_iter(self) -> Self::IntoIter {
        self.store.iter()
    }
}
