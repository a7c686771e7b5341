//! Progressive quality tracking over the data-bins of one image part.
//!
//! A consumer names a sequence of quality stages it wants to be told about
//! ("first layer as soon as possible, then everything"). The waiter listens
//! on the part's tile-header and precinct data-bins, keeps the per-precinct
//! layer progress current through the shared precinct arena, and fires the
//! consumer's callback whenever the slowest precinct crosses the next stage
//! threshold.
//!
//! When one arrival satisfies several stages at once only the furthest one
//! is reported, so a consumer never renders a frame it would immediately
//! replace. A stage marked `force` is exempt and always reported, unless the
//! stage right after it is a satisfied maximum-quality stage that covers the
//! exact same bytes.

use crate::packet::SharedPrecinctArena;
use crate::structure::{CodestreamPartParams, CodestreamStructure, PrecinctReference};
use jpip::{DataArrivedListener, Databin, DatabinClass, DatabinStore, ListenerId};
use log::warn;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// A quality level a consumer can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressivenessQuality {
    /// At least this many full quality layers of every precinct.
    Layers(u16),
    /// Every byte of every precinct the server will ever send.
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressivenessStage {
    pub min_quality: ProgressivenessQuality,
    /// Report this stage even when a later stage is satisfied at the same
    /// time.
    pub force: bool,
}

/// Passed to the consumer's callback on every reported stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityReport {
    pub stage_index: usize,
    /// Quality reached by the slowest precinct of the part at fire time.
    pub min_quality: ProgressivenessQuality,
    /// True once the last stage has been reached.
    pub is_done: bool,
}

pub type QualityCallback = Box<dyn FnMut(&QualityReport)>;

#[derive(Debug, Clone, Copy)]
struct PrecinctProgress {
    reached_layers: u16,
    /// The precinct cannot improve further: every layer its stream carries
    /// (the declared count, or less when an aux hint says so) is fully
    /// buffered, or its data-bin is complete.
    own_max_reached: bool,
}

struct WaiterInner {
    structure: Rc<CodestreamStructure>,
    arena: SharedPrecinctArena,
    stages: Vec<ProgressivenessStage>,
    next_stage: usize,
    callback: Option<QualityCallback>,
    precincts: HashMap<u64, PrecinctProgress>,
    pending_tile_headers: usize,
    /// Set once a precinct data-bin turned out malformed. The part can never
    /// be displayed beyond what was already reported, so no further stage
    /// fires.
    failed: bool,
}

impl WaiterInner {
    /// Refreshes one precinct's progress from its data-bin. True when the
    /// progress changed.
    fn on_precinct_data(&mut self, reference: &PrecinctReference, databin: &Databin) -> bool {
        let max_layers = self.structure.num_quality_layers();
        // A *WithAux message told us how many layers this precinct's stream
        // actually carries; beyond that nothing more will ever arrive.
        let own_layer_cap = match databin.aux() {
            Some(aux) => aux.min(u32::from(max_layers)) as u16,
            None => max_layers,
        };
        let structure = self.structure.clone();
        let mut arena = self.arena.borrow_mut();
        let cache = arena.cache_for(reference.in_class_id, || {
            structure.precinct_geometry(reference)
        });
        let offset = match cache.calculate_end_offset_of_last_full_packet(databin, max_layers) {
            Ok(offset) => offset,
            Err(err) => {
                warn!(
                    "precinct data-bin {}: packet headers unreadable: {}",
                    reference.in_class_id, err
                );
                self.failed = true;
                return false;
            }
        };
        drop(arena);

        let progress = PrecinctProgress {
            reached_layers: offset.num_full_quality_layers,
            own_max_reached: offset.num_full_quality_layers >= own_layer_cap
                || databin.is_all_databin_loaded(),
        };
        let entry = self
            .precincts
            .get_mut(&reference.in_class_id)
            .expect("arrival for a precinct outside the watched part");
        let changed = entry.reached_layers != progress.reached_layers
            || entry.own_max_reached != progress.own_max_reached;
        *entry = progress;
        changed
    }

    fn is_stage_satisfied(&self, index: usize) -> bool {
        match self.stages[index].min_quality {
            ProgressivenessQuality::Max => {
                self.precincts.values().all(|p| p.own_max_reached)
            }
            ProgressivenessQuality::Layers(layers) => {
                let threshold = layers.min(self.structure.num_quality_layers());
                self.precincts
                    .values()
                    .all(|p| p.own_max_reached || p.reached_layers >= threshold)
            }
        }
    }

    /// A forced stage collapses into its successor only when the successor
    /// is a satisfied maximum-quality stage that adds no bytes beyond the
    /// forced stage's threshold.
    fn forced_stage_covered_by_next(&self, index: usize) -> bool {
        let next = index + 1;
        if next >= self.stages.len() || !self.is_stage_satisfied(next) {
            return false;
        }
        if self.stages[next].min_quality != ProgressivenessQuality::Max {
            return false;
        }
        match self.stages[index].min_quality {
            ProgressivenessQuality::Max => true,
            ProgressivenessQuality::Layers(threshold) => self
                .precincts
                .values()
                .all(|p| p.own_max_reached && p.reached_layers <= threshold),
        }
    }

    fn minimum_reached_quality(&self) -> ProgressivenessQuality {
        let mut minimum: Option<u16> = None;
        for progress in self.precincts.values() {
            if progress.own_max_reached {
                continue;
            }
            minimum = Some(match minimum {
                Some(current) => current.min(progress.reached_layers),
                None => progress.reached_layers,
            });
        }
        match minimum {
            Some(layers) => ProgressivenessQuality::Layers(layers),
            None => ProgressivenessQuality::Max,
        }
    }

    /// Steps through every satisfied stage and collects the ones whose
    /// callback should fire, applying the collapse rules.
    fn advance(&mut self) -> Vec<QualityReport> {
        if self.failed || self.pending_tile_headers > 0 {
            return Vec::new();
        }
        let mut fired = Vec::new();
        while self.next_stage < self.stages.len() && self.is_stage_satisfied(self.next_stage) {
            let index = self.next_stage;
            self.next_stage += 1;
            let next_satisfied =
                self.next_stage < self.stages.len() && self.is_stage_satisfied(self.next_stage);
            let skip = if self.stages[index].force {
                self.forced_stage_covered_by_next(index)
            } else {
                next_satisfied
            };
            if !skip {
                fired.push(QualityReport {
                    stage_index: index,
                    min_quality: self.minimum_reached_quality(),
                    is_done: self.next_stage >= self.stages.len(),
                });
            }
        }
        fired
    }
}

fn dispatch_reports(inner: &Rc<RefCell<WaiterInner>>, reports: &[QualityReport]) {
    if reports.is_empty() {
        return;
    }
    // The callback runs without the inner borrow held, so it may query the
    // waiter or the arena freely.
    let callback = inner.borrow_mut().callback.take();
    if let Some(mut callback) = callback {
        for report in reports {
            callback(report);
        }
        let mut guard = inner.borrow_mut();
        if guard.callback.is_none() {
            guard.callback = Some(callback);
        }
    }
}

struct PrecinctArrivalListener {
    inner: Weak<RefCell<WaiterInner>>,
    reference: PrecinctReference,
}

impl DataArrivedListener for PrecinctArrivalListener {
    fn data_arrived(&self, databin: &Databin) {
        let inner = self
            .inner
            .upgrade()
            .expect("precinct data arrived for a dropped quality waiter");
        let reports = {
            let mut guard = inner.borrow_mut();
            if guard.on_precinct_data(&self.reference, databin) {
                guard.advance()
            } else {
                Vec::new()
            }
        };
        dispatch_reports(&inner, &reports);
    }
}

struct TileHeaderArrivalListener {
    inner: Weak<RefCell<WaiterInner>>,
    counted: Cell<bool>,
}

impl DataArrivedListener for TileHeaderArrivalListener {
    fn data_arrived(&self, databin: &Databin) {
        if self.counted.get() || !databin.is_all_databin_loaded() {
            return;
        }
        self.counted.set(true);
        let inner = self
            .inner
            .upgrade()
            .expect("tile header arrived for a dropped quality waiter");
        let reports = {
            let mut guard = inner.borrow_mut();
            guard.pending_tile_headers -= 1;
            guard.advance()
        };
        dispatch_reports(&inner, &reports);
    }
}

/// Stage-by-stage quality progress tracker for one image part.
///
/// Stage evaluation is held back until every tile header of the part has
/// fully arrived; no quality is meaningful before the tile headers a
/// reconstruction would need are present.
pub struct QualityWaiter {
    inner: Rc<RefCell<WaiterInner>>,
    precinct_references: Vec<PrecinctReference>,
    tile_indices: Vec<u32>,
    handles: Vec<(DatabinClass, u64, ListenerId)>,
    registered: bool,
}

impl QualityWaiter {
    pub fn new(
        structure: Rc<CodestreamStructure>,
        arena: SharedPrecinctArena,
        part: &CodestreamPartParams,
        stages: Vec<ProgressivenessStage>,
        callback: QualityCallback,
    ) -> Self {
        assert!(!stages.is_empty(), "a waiter needs at least one stage");
        let precinct_references = structure.precincts_in_part(part);
        let tile_indices = structure.tiles_in_part(part);
        let precincts = precinct_references
            .iter()
            .map(|reference| {
                (
                    reference.in_class_id,
                    PrecinctProgress {
                        reached_layers: 0,
                        own_max_reached: false,
                    },
                )
            })
            .collect();
        QualityWaiter {
            inner: Rc::new(RefCell::new(WaiterInner {
                structure,
                arena,
                stages,
                next_stage: 0,
                callback: Some(callback),
                precincts,
                pending_tile_headers: tile_indices.len(),
                failed: false,
            })),
            precinct_references,
            tile_indices,
            handles: Vec::new(),
            registered: false,
        }
    }

    /// Attaches the waiter to the store and evaluates the already-buffered
    /// state; stages the buffered bytes already satisfy fire from here.
    pub fn register(&mut self, store: &mut DatabinStore) {
        if self.registered {
            return;
        }
        self.registered = true;
        let weak = Rc::downgrade(&self.inner);

        let mut tile_listeners = Vec::new();
        for &tile in &self.tile_indices {
            let listener = Rc::new(TileHeaderArrivalListener {
                inner: weak.clone(),
                counted: Cell::new(false),
            });
            let id =
                store.add_listener(DatabinClass::TileHeader, u64::from(tile), listener.clone());
            self.handles
                .push((DatabinClass::TileHeader, u64::from(tile), id));
            tile_listeners.push((tile, listener));
        }
        for reference in &self.precinct_references {
            let listener = Rc::new(PrecinctArrivalListener {
                inner: weak.clone(),
                reference: *reference,
            });
            let id = store.add_listener(DatabinClass::Precinct, reference.in_class_id, listener);
            self.handles
                .push((DatabinClass::Precinct, reference.in_class_id, id));
        }

        let reports = {
            let mut inner = self.inner.borrow_mut();
            for (tile, listener) in &tile_listeners {
                let complete = store
                    .databin(DatabinClass::TileHeader, u64::from(*tile))
                    .map_or(false, |databin| databin.is_all_databin_loaded());
                if complete {
                    listener.counted.set(true);
                    inner.pending_tile_headers -= 1;
                }
            }
            for reference in &self.precinct_references {
                if let Some(databin) =
                    store.databin(DatabinClass::Precinct, reference.in_class_id)
                {
                    inner.on_precinct_data(reference, databin);
                }
            }
            inner.advance()
        };
        dispatch_reports(&self.inner, &reports);
    }

    /// Detaches from the store. Safe to call more than once and after the
    /// waiter completed.
    pub fn unregister(&mut self, store: &mut DatabinStore) {
        if !self.registered {
            return;
        }
        self.registered = false;
        for (class, in_class_id, id) in self.handles.drain(..) {
            store.remove_listener(class, in_class_id, id);
        }
        self.inner.borrow_mut().callback = None;
    }

    pub fn is_done(&self) -> bool {
        let inner = self.inner.borrow();
        inner.next_stage >= inner.stages.len()
    }

    /// True once a precinct data-bin of the part carried malformed packet
    /// headers. A failed waiter never fires another stage; the consumer
    /// cannot display the part beyond what was already reported.
    pub fn is_failed(&self) -> bool {
        self.inner.borrow().failed
    }

    pub fn minimum_reached_quality(&self) -> ProgressivenessQuality {
        self.inner.borrow().minimum_reached_quality()
    }
}
