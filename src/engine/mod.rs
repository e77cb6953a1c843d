mod conflict;
mod error;
mod mutations;
mod policy;
mod queries;
mod recurrence;

pub use error::EngineError;
pub use policy::{edited_status, initial_status, needs_approval};
pub use recurrence::expand;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One tenant's booking engine: per-room state behind RwLocks, a WAL for
/// durability, a notify hub for the dispatcher contract. The per-room write
/// lock is the transaction boundary — expansion, conflict checks and the
/// batch commit for one request all happen under a single acquisition.
pub struct Engine {
    pub rooms: DashMap<Ulid, SharedRoomState>,
    pub equipment: DashMap<Ulid, Equipment>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → room id
    pub(super) booking_to_room: DashMap<Ulid, Ulid>,
}

/// Apply an event directly to a RoomState (no locking — caller holds the lock).
fn apply_to_room(rs: &mut RoomState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingRequested {
            id,
            room_id,
            series_id,
            owner,
            span,
            title,
            participants,
            chairman,
            department,
            description,
            extra_requests,
            notes,
            equipment,
            status,
            notified,
            created_at,
            updated_at,
        } => {
            rs.insert_booking(BookingState {
                id: *id,
                series_id: *series_id,
                owner: owner.clone(),
                span: *span,
                title: title.clone(),
                participants: *participants,
                chairman: chairman.clone(),
                department: department.clone(),
                description: description.clone(),
                extra_requests: extra_requests.clone(),
                notes: notes.clone(),
                equipment: equipment.clone(),
                status: *status,
                notified: *notified,
                created_at: *created_at,
                updated_at: *updated_at,
            });
            booking_index.insert(*id, *room_id);
        }
        Event::BookingApproved { id, at, .. } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.status = BookingStatus::Approved;
                b.updated_at = *at;
            }
        }
        Event::BookingRejected { id, at, .. } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.status = BookingStatus::Rejected;
                b.updated_at = *at;
            }
        }
        Event::BookingCancelled { id, at, .. } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.status = BookingStatus::Cancelled;
                b.updated_at = *at;
            }
        }
        Event::BookingEdited {
            id,
            span,
            title,
            participants,
            chairman,
            department,
            description,
            extra_requests,
            notes,
            equipment,
            status,
            at,
            ..
        } => {
            // Remove and re-insert so the sort order follows the new span.
            if let Some(mut b) = rs.remove_booking(*id) {
                b.span = *span;
                b.title = title.clone();
                b.participants = *participants;
                b.chairman = chairman.clone();
                b.department = department.clone();
                b.description = description.clone();
                b.extra_requests = extra_requests.clone();
                b.notes = notes.clone();
                b.equipment = equipment.clone();
                b.status = *status;
                b.updated_at = *at;
                rs.insert_booking(b);
            }
        }
        Event::ReminderSent { id, .. } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.notified = true;
            }
        }
        Event::RoomUpdated {
            name,
            capacity,
            location,
            approver,
            maintenance,
            ..
        } => {
            rs.name = name.clone();
            rs.capacity = *capacity;
            rs.location = location.clone();
            rs.approver = approver.clone();
            rs.maintenance = *maintenance;
        }
        // Room create/delete and the equipment registry are handled at the
        // engine map level, not here.
        Event::RoomCreated { .. }
        | Event::RoomDeleted { .. }
        | Event::EquipmentAdded { .. }
        | Event::EquipmentRemoved { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            equipment: DashMap::new(),
            wal_tx,
            notify,
            booking_to_room: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly (no contention). Never use blocking_read/blocking_write
        // here because this may run inside an async context (e.g. lazy tenant creation).
        for event in &events {
            match event {
                Event::RoomCreated { id, name, capacity, location, approver, maintenance } => {
                    let rs = RoomState::new(
                        *id,
                        name.clone(),
                        *capacity,
                        location.clone(),
                        approver.clone(),
                        *maintenance,
                    );
                    engine.rooms.insert(*id, Arc::new(RwLock::new(rs)));
                }
                Event::RoomDeleted { id } => {
                    if let Some(entry) = engine.rooms.get(id) {
                        let rs = entry.try_read().expect("replay: uncontended read");
                        for b in &rs.bookings {
                            engine.booking_to_room.remove(&b.id);
                        }
                    }
                    engine.rooms.remove(id);
                }
                Event::EquipmentAdded { id, name, description } => {
                    engine.equipment.insert(
                        *id,
                        Equipment {
                            id: *id,
                            name: name.clone(),
                            description: description.clone(),
                        },
                    );
                }
                Event::EquipmentRemoved { id } => {
                    engine.equipment.remove(id);
                }
                other => {
                    if let Some(room_id) = event_room_id(other)
                        && let Some(entry) = engine.rooms.get(&room_id) {
                            let rs_arc = entry.clone();
                            let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                            apply_to_room(&mut guard, other, &engine.booking_to_room);
                        }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply in one call. Notifications are published separately
    /// by each mutation — only status-affecting transitions notify, and a
    /// recurring batch notifies once.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.booking_to_room);
        Ok(())
    }

    /// Lookup booking → room, get room, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .room_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.write_owned().await;
        Ok((room_id, guard))
    }

    /// Resolve equipment ids to display names; dangling ids are skipped.
    pub(super) fn equipment_names(&self, ids: &[Ulid]) -> Vec<String> {
        ids.iter()
            .filter_map(|id| self.equipment.get(id).map(|e| e.name.clone()))
            .collect()
    }
}

/// Extract the room id from an event that applies to one room's state.
fn event_room_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingRequested { room_id, .. }
        | Event::BookingApproved { room_id, .. }
        | Event::BookingRejected { room_id, .. }
        | Event::BookingCancelled { room_id, .. }
        | Event::BookingEdited { room_id, .. }
        | Event::ReminderSent { room_id, .. } => Some(*room_id),
        Event::RoomUpdated { id, .. } => Some(*id),
        Event::RoomCreated { .. }
        | Event::RoomDeleted { .. }
        | Event::EquipmentAdded { .. }
        | Event::EquipmentRemoved { .. } => None,
    }
}
