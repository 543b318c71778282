//! Sub-streams carried inside a tunnel

use std::collections::BTreeMap;

use omm_tunnel_proto::{GenericKind, StreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemPhase {
    Requested,
    Open,
    Closed,
}

/// State of one sub-stream inside a tunnel session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemState {
    pub domain_type: u8,
    pub phase: ItemPhase,
    pub update_count: u64,
}

/// Session-owned table of sub-stream state keyed by sub-stream id
#[derive(Debug, Default)]
pub struct ItemTable {
    items: BTreeMap<StreamId, ItemState>,
}

impl ItemTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&mut self, stream_id: StreamId, domain_type: u8) {
        self.items.insert(
            stream_id,
            ItemState {
                domain_type,
                phase: ItemPhase::Requested,
                update_count: 0,
            },
        );
    }

    pub fn opened(&mut self, stream_id: StreamId, domain_type: u8) {
        self.items
            .entry(stream_id)
            .and_modify(|item| item.phase = ItemPhase::Open)
            .or_insert(ItemState {
                domain_type,
                phase: ItemPhase::Open,
                update_count: 0,
            });
    }

    pub fn updated(&mut self, stream_id: StreamId) {
        if let Some(item) = self.items.get_mut(&stream_id) {
            item.update_count += 1;
        }
    }

    pub fn closed(&mut self, stream_id: StreamId) {
        if let Some(item) = self.items.get_mut(&stream_id) {
            item.phase = ItemPhase::Closed;
        }
    }

    /// Track a generic message seen in either direction
    pub fn on_generic(&mut self, stream_id: StreamId, domain_type: u8, kind: GenericKind) {
        match kind {
            GenericKind::Request => self.requested(stream_id, domain_type),
            GenericKind::Refresh => self.opened(stream_id, domain_type),
            GenericKind::Update => self.updated(stream_id),
            GenericKind::Close => self.closed(stream_id),
        }
    }

    pub fn get(&self, stream_id: StreamId) -> Option<&ItemState> {
        self.items.get(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
