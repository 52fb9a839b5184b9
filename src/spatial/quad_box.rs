use serde::{Deserialize, Serialize};

use crate::data::geometry::{OsmPoint, OsmRect, MAP_RECT};
use crate::data::osm::ExtendedId;

/// Quads narrower than this are never subdivided for downloading.
pub const MIN_RECT_SIZE: f64 = 360.0 / (1u32 << 16) as f64;
pub const MAX_MEMBERS_PER_LEVEL: usize = 16;
/// About two feet wide at the equator.
pub const MAX_DEPTH: usize = 26;

/// Node of both quadtrees. The region tree uses the download bookkeeping,
/// the object tree uses `members` and `is_split`.
///
/// Children are indexed by two bits: bit 0 set means the western half, bit 1
/// set means the half with the smaller latitude.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QuadBox {
    pub rect: OsmRect,
    pub children: [Option<Box<QuadBox>>; 4],
    /// Seconds since the unix epoch, 0 when never downloaded.
    #[serde(rename = "date")]
    pub download_date: f64,
    pub whole: bool,
    #[serde(skip)]
    pub busy: bool,
    #[serde(rename = "split")]
    pub is_split: bool,
    #[serde(skip)]
    pub members: Vec<(ExtendedId, OsmRect)>,
}

impl Default for QuadBox {
    fn default() -> Self {
        QuadBox::new(MAP_RECT)
    }
}

pub fn child_rect(index: usize, parent: &OsmRect) -> OsmRect {
    let width = parent.width * 0.5;
    let height = parent.height * 0.5;
    let x = if index & 1 != 0 { parent.x } else { parent.x + width };
    let y = if index & 2 != 0 { parent.y } else { parent.y + height };
    OsmRect::new(x, y, width, height)
}

impl QuadBox {
    pub fn new(rect: OsmRect) -> Self {
        QuadBox {
            rect,
            children: [None, None, None, None],
            download_date: 0.0,
            whole: false,
            busy: false,
            is_split: false,
            members: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = QuadBox::new(self.rect);
    }

    pub fn has_children(&self) -> bool {
        self.children.iter().any(Option::is_some)
    }

    pub fn child_for_point(&self, point: OsmPoint) -> usize {
        let west = point.x < self.rect.x + self.rect.width * 0.5;
        let north = point.y < self.rect.y + self.rect.height * 0.5;
        (usize::from(north) << 1) | usize::from(west)
    }

    /// `None` when `member` straddles a midline and has to stay here.
    pub fn child_for_rect(&self, member: &OsmRect) -> Option<usize> {
        let mid_x = self.rect.x + self.rect.width * 0.5;
        let mid_y = self.rect.y + self.rect.height * 0.5;
        let mut west = false;
        let mut north = false;
        if member.x < mid_x {
            if member.max_x() >= mid_x {
                return None;
            }
            west = true;
        }
        if member.y < mid_y {
            if member.max_y() >= mid_y {
                return None;
            }
            north = true;
        }
        Some((usize::from(north) << 1) | usize::from(west))
    }

    fn child_or_insert(&mut self, index: usize) -> &mut QuadBox {
        let rect = child_rect(index, &self.rect);
        self.children[index].get_or_insert_with(|| Box::new(QuadBox::new(rect)))
    }

    pub fn for_each(&self, f: &mut dyn FnMut(&QuadBox)) {
        f(self);
        for child in self.children.iter().flatten() {
            child.for_each(f);
        }
    }

    pub fn count_busy(&self) -> usize {
        let mut count = 0;
        self.for_each(&mut |quad| {
            if quad.busy {
                count += 1
            }
        });
        count
    }

    // Region

    pub fn missing_pieces(&mut self, missing: &mut Vec<OsmRect>, needed: &OsmRect) {
        if self.whole || self.busy {
            return;
        }
        if !needed.intersects(&self.rect) {
            return;
        }
        if self.rect.width <= MIN_RECT_SIZE
            || self.rect.width <= needed.width / 2.0
            || self.rect.height <= needed.height / 2.0
        {
            self.busy = true;
            missing.push(self.rect);
            return;
        }
        if needed.contains_rect(&self.rect) && !self.has_children() {
            self.busy = true;
            missing.push(self.rect);
            return;
        }
        for index in 0..4 {
            let rect = child_rect(index, &self.rect);
            if needed.intersects(&rect) {
                self.child_or_insert(index).missing_pieces(missing, needed);
            }
        }
    }

    fn settle(&mut self, success: bool, date: f64) {
        self.busy = false;
        if success {
            self.download_date = date;
            self.whole = true;
            self.children = [None, None, None, None];
        }
    }

    /// Records the outcome of a download of the quad at `target`. Returns
    /// false when no such quad is pending anymore.
    pub fn make_whole(&mut self, target: &OsmRect, success: bool, date: f64) -> bool {
        if self.rect == *target {
            self.settle(success, date);
            return true;
        }
        let Some(index) = (0..4).find(|&i| child_rect(i, &self.rect).contains_rect(target)) else {
            return false;
        };
        let parent_whole = self.whole;
        let Some(child) = self.children[index].as_mut() else {
            return false;
        };
        if child.rect == *target {
            if parent_whole {
                // parent completed first, the child is redundant
                child.busy = false;
                if child.count_busy() == 0 {
                    self.children[index] = None;
                }
                return true;
            }
            child.settle(success, date);
            if success
                && self
                    .children
                    .iter()
                    .all(|c| c.as_ref().map(|c| c.whole).unwrap_or(false))
            {
                // keep the children for fine grained discards
                self.whole = true;
            }
            return true;
        }
        child.make_whole(target, success, date)
    }

    /// Returns `(changed, remove_self)`.
    fn discard_older_than(&mut self, date: f64, protected: &[OsmRect]) -> (bool, bool) {
        if self.busy {
            return (false, false);
        }
        let is_protected = protected.iter().any(|rect| rect.intersects(&self.rect));
        if self.download_date != 0.0 && self.download_date < date && !is_protected {
            return (true, true);
        }
        let mut changed = false;
        for index in 0..4 {
            let Some(child) = self.children[index].as_mut() else {
                continue;
            };
            let (child_changed, remove) = child.discard_older_than(date, protected);
            if remove {
                self.children[index] = None;
                self.whole = false;
            }
            changed |= child_changed;
        }
        let remove =
            changed && !self.whole && self.download_date == 0.0 && !self.has_children();
        (changed, remove)
    }

    /// Drops coverage older than `date`. The root itself is never removed.
    pub fn discard_quads_older_than(&mut self, date: f64, protected: &[OsmRect]) -> bool {
        let (changed, remove) = self.discard_older_than(date, protected);
        if remove {
            let rect = self.rect;
            *self = QuadBox::new(rect);
        }
        changed
    }

    pub fn point_is_covered(&self, point: OsmPoint) -> bool {
        if self.download_date != 0.0 {
            return true;
        }
        match &self.children[self.child_for_point(point)] {
            Some(child) => child.point_is_covered(point),
            None => false,
        }
    }

    // Objects

    fn add_member_at(&mut self, member: ExtendedId, bbox: OsmRect, depth: usize) {
        if !self.is_split && (depth >= MAX_DEPTH || self.members.len() < MAX_MEMBERS_PER_LEVEL) {
            self.members.push((member, bbox));
            return;
        }
        if !self.is_split {
            self.is_split = true;
            let previous = std::mem::take(&mut self.members);
            for (id, rect) in previous {
                self.add_member_at(id, rect, depth);
            }
        }
        match self.child_for_rect(&bbox) {
            Some(index) => self
                .child_or_insert(index)
                .add_member_at(member, bbox, depth + 1),
            None => {
                if !self.members.iter().any(|(id, _)| *id == member) {
                    self.members.push((member, bbox));
                }
            }
        }
    }

    pub fn add_member(&mut self, member: ExtendedId, bbox: OsmRect) {
        self.add_member_at(member, bbox, 0);
    }

    pub fn remove_member(&mut self, member: ExtendedId, bbox: &OsmRect) -> bool {
        if let Some(position) = self.members.iter().position(|(id, _)| *id == member) {
            self.members.remove(position);
            return true;
        }
        for index in 0..4 {
            let rect = child_rect(index, &self.rect);
            if let Some(child) = self.children[index].as_mut() {
                if bbox.intersects(&rect) && child.remove_member(member, bbox) {
                    return true;
                }
            }
        }
        false
    }

    pub fn delete_objects(&mut self, predicate: &mut dyn FnMut(ExtendedId) -> bool) {
        self.members.retain(|(id, _)| !predicate(*id));
        for child in self.children.iter_mut().flatten() {
            child.delete_objects(predicate);
        }
    }

    pub fn find_objects(&self, area: OsmRect) -> FindObjects<'_> {
        FindObjects {
            stack: vec![self],
            current: Default::default(),
            area,
        }
    }
}

/// Lazy walk over members whose box intersects `area`.
pub struct FindObjects<'a> {
    stack: Vec<&'a QuadBox>,
    current: std::slice::Iter<'a, (ExtendedId, OsmRect)>,
    area: OsmRect,
}

impl<'a> Iterator for FindObjects<'a> {
    type Item = ExtendedId;

    fn next(&mut self) -> Option<ExtendedId> {
        loop {
            for (id, bbox) in self.current.by_ref() {
                if bbox.intersects(&self.area) {
                    return Some(*id);
                }
            }
            let quad = self.stack.pop()?;
            for child in quad.children.iter().flatten() {
                if self.area.intersects(&child.rect) {
                    self.stack.push(child);
                }
            }
            self.current = quad.members.iter();
        }
    }
}
