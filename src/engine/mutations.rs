use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::auth::Actor;
use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;

use super::conflict::{conflicting_starts, validate_span};
use super::{policy, recurrence, Engine, EngineError, SharedRoomState, WalCommand};

impl Engine {
    // ── Room registry (admin-only) ───────────────────────────

    pub async fn create_room(
        &self,
        id: Ulid,
        name: String,
        capacity: u32,
        location: Option<String>,
        approver: Option<String>,
        maintenance: Option<Span>,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        if !actor.is_admin {
            return Err(EngineError::PermissionDenied("administrator required"));
        }
        if self.rooms.len() >= MAX_ROOMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        validate_room_fields(&name, capacity, &maintenance)?;
        if self.rooms.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::RoomCreated {
            id,
            name: name.clone(),
            capacity,
            location: location.clone(),
            approver: approver.clone(),
            maintenance,
        };
        self.wal_append(&event).await?;
        let rs = RoomState::new(id, name, capacity, location, approver, maintenance);
        self.rooms.insert(id, Arc::new(RwLock::new(rs)));
        Ok(())
    }

    pub async fn update_room(
        &self,
        id: Ulid,
        name: String,
        capacity: u32,
        location: Option<String>,
        approver: Option<String>,
        maintenance: Option<Span>,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        if !actor.is_admin {
            return Err(EngineError::PermissionDenied("administrator required"));
        }
        validate_room_fields(&name, capacity, &maintenance)?;
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;

        let event = Event::RoomUpdated { id, name, capacity, location, approver, maintenance };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Deleting a room deletes its bookings. Destructive by design — the
    /// cascade is inherited from the product's data model.
    pub async fn delete_room(&self, id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        if !actor.is_admin {
            return Err(EngineError::PermissionDenied("administrator required"));
        }
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        let booking_ids: Vec<Ulid> = guard.bookings.iter().map(|b| b.id).collect();
        drop(guard);

        let event = Event::RoomDeleted { id };
        self.wal_append(&event).await?;
        self.rooms.remove(&id);
        for booking_id in booking_ids {
            self.booking_to_room.remove(&booking_id);
        }
        self.notify.remove(&id);
        Ok(())
    }

    // ── Equipment registry (admin-only) ──────────────────────

    pub async fn add_equipment(
        &self,
        id: Ulid,
        name: String,
        description: String,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        if !actor.is_admin {
            return Err(EngineError::PermissionDenied("administrator required"));
        }
        if self.equipment.len() >= MAX_EQUIPMENT_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many equipment items"));
        }
        if name.trim().is_empty() || name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("equipment name length"));
        }
        if description.len() > MAX_TEXT_LEN {
            return Err(EngineError::LimitExceeded("equipment description too long"));
        }
        if self.equipment.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::EquipmentAdded {
            id,
            name: name.clone(),
            description: description.clone(),
        };
        self.wal_append(&event).await?;
        self.equipment.insert(id, Equipment { id, name, description });
        Ok(())
    }

    /// Removal does not rewrite booking references; a dangling equipment id
    /// is skipped when display names are resolved.
    pub async fn remove_equipment(&self, id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        if !actor.is_admin {
            return Err(EngineError::PermissionDenied("administrator required"));
        }
        if !self.equipment.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::EquipmentRemoved { id };
        self.wal_append(&event).await?;
        self.equipment.remove(&id);
        Ok(())
    }

    // ── Booking lifecycle ────────────────────────────────────

    /// Create a booking, expanding its recurrence into occurrences.
    ///
    /// All-or-nothing: if any occurrence conflicts, nothing is persisted and
    /// the error carries every conflicting start. The whole sequence —
    /// expansion, conflict scan, commit — runs under the room's write lock,
    /// so concurrent requests for the same room serialize and cannot both
    /// claim an overlapping slot.
    ///
    /// Returns the ids of the created occurrences; the first is `req.id`.
    pub async fn create_booking(
        &self,
        req: BookingRequest,
        actor: &Actor,
    ) -> Result<Vec<Ulid>, EngineError> {
        validate_span(&req.span)?;
        let now = Utc::now();
        if req.span.start < now && !actor.is_admin {
            return Err(EngineError::InvalidTimeRange("start is in the past"));
        }
        if req.participants == 0 {
            return Err(EngineError::LimitExceeded("participants must be at least 1"));
        }
        validate_booking_texts(
            &req.title,
            &req.chairman,
            &req.department,
            &req.description,
            &req.extra_requests,
            &req.notes,
        )?;
        if req.equipment.len() > MAX_EQUIPMENT_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many equipment items on booking"));
        }
        for equipment_id in &req.equipment {
            if !self.equipment.contains_key(equipment_id) {
                return Err(EngineError::NotFound(*equipment_id));
            }
        }
        if self.booking_to_room.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let rs = self
            .get_room(&req.room_id)
            .ok_or(EngineError::NotFound(req.room_id))?;
        let mut guard = rs.write().await;

        if guard.under_maintenance(now) {
            return Err(EngineError::UnderMaintenance(guard.id));
        }
        // Capacity is a validation failure and fires before the approval
        // decision: an oversized meeting never enters the workflow.
        if req.participants > guard.capacity {
            return Err(EngineError::CapacityExceeded {
                requested: req.participants,
                capacity: guard.capacity,
            });
        }

        let occurrences = recurrence::expand(req.span, &req.recurrence)?;
        if occurrences.is_empty() {
            return Err(EngineError::InvalidTimeRange(
                "recurrence ends before the first occurrence",
            ));
        }
        if guard.bookings.len() + occurrences.len() > MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings in room"));
        }

        // Phase 1: the whole batch must be admissible.
        let conflicts = conflicting_starts(&guard, &occurrences, None);
        if !conflicts.is_empty() {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Conflict(conflicts));
        }

        let status = policy::initial_status(
            req.participants,
            &req.extra_requests,
            &req.notes,
            !req.equipment.is_empty(),
        );
        let series_id = (occurrences.len() > 1).then(Ulid::new);
        let owner = Some(actor.name.clone());

        let mut events = Vec::with_capacity(occurrences.len());
        let mut ids = Vec::with_capacity(occurrences.len());
        for (i, occ) in occurrences.iter().enumerate() {
            let id = if i == 0 { req.id } else { Ulid::new() };
            ids.push(id);
            events.push(Event::BookingRequested {
                id,
                room_id: req.room_id,
                series_id,
                owner: owner.clone(),
                span: *occ,
                title: req.title.clone(),
                participants: req.participants,
                chairman: req.chairman.clone(),
                department: req.department.clone(),
                description: req.description.clone(),
                extra_requests: req.extra_requests.clone(),
                notes: req.notes.clone(),
                equipment: req.equipment.clone(),
                status,
                notified: false,
                created_at: now,
                updated_at: now,
            });
        }

        // Phase 2: all validated — make the batch durable, then apply.
        for event in &events {
            self.wal_append(event).await?;
        }
        for event in &events {
            super::apply_to_room(&mut guard, event, &self.booking_to_room);
        }

        // One Created notification per creation call, first occurrence only.
        if let Some(first) = guard.booking(ids[0]) {
            let names = self.equipment_names(&first.equipment);
            let n = Notification::created(first, guard.id, &guard.name, &names);
            self.notify.publish(guard.id, n);
        }

        Ok(ids)
    }

    pub async fn approve_booking(&self, id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        self.decide_booking(id, actor, true).await
    }

    pub async fn reject_booking(&self, id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        self.decide_booking(id, actor, false).await
    }

    async fn decide_booking(
        &self,
        id: Ulid,
        actor: &Actor,
        approve: bool,
    ) -> Result<(), EngineError> {
        let action = if approve { "approve" } else { "reject" };
        let (room_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        let old = booking.status;
        if old != BookingStatus::Pending {
            return Err(EngineError::InvalidTransition { from: old, action });
        }
        let caps = actor.capabilities_for(&guard);
        if !caps.is_approver {
            return Err(EngineError::PermissionDenied(
                "only the room's approver may decide this booking",
            ));
        }

        let at = Utc::now();
        let event = if approve {
            Event::BookingApproved { id, room_id, actor: actor.name.clone(), at }
        } else {
            Event::BookingRejected { id, room_id, actor: actor.name.clone(), at }
        };
        self.persist_and_apply(&mut guard, &event).await?;

        if let Some(b) = guard.booking(id) {
            let names = self.equipment_names(&b.equipment);
            let n = Notification::status_changed(b, old, room_id, &guard.name, &names);
            self.notify.publish(room_id, n);
        }
        Ok(())
    }

    pub async fn cancel_booking(&self, id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        let (room_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        let old = booking.status;
        if !old.is_active() {
            return Err(EngineError::InvalidTransition { from: old, action: "cancel" });
        }
        let now = Utc::now();
        let is_owner = booking.owner.as_deref() == Some(actor.name.as_str());
        // Owners may cancel their own bookings until the end time; admins
        // may cancel anything.
        if !actor.is_admin && !(is_owner && booking.span.end > now) {
            return Err(EngineError::PermissionDenied(
                "only the owner (before the booking ends) or an admin may cancel",
            ));
        }

        let event = Event::BookingCancelled { id, room_id, actor: actor.name.clone(), at: now };
        self.persist_and_apply(&mut guard, &event).await?;

        if let Some(b) = guard.booking(id) {
            let names = self.equipment_names(&b.equipment);
            let n = Notification::status_changed(b, old, room_id, &guard.name, &names);
            self.notify.publish(room_id, n);
        }
        Ok(())
    }

    /// Edit time and/or content of an active booking. The conflict check
    /// excludes the booking itself, so a reschedule that only collides with
    /// its own prior slot succeeds. The approval policy is re-run
    /// demote-only (see `policy::edited_status`).
    pub async fn edit_booking(
        &self,
        id: Ulid,
        patch: BookingPatch,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        let (room_id, mut guard) = self.resolve_booking_write(&id).await?;
        let current = guard.booking(id).ok_or(EngineError::NotFound(id))?.clone();
        let old = current.status;
        if !old.is_active() {
            return Err(EngineError::InvalidTransition { from: old, action: "edit" });
        }
        let now = Utc::now();
        let is_owner = current.owner.as_deref() == Some(actor.name.as_str());
        if !actor.is_admin && !is_owner {
            return Err(EngineError::PermissionDenied("only the owner or an admin may edit"));
        }
        if !actor.is_admin && current.span.end <= now {
            return Err(EngineError::PermissionDenied(
                "cannot edit a booking that already ended",
            ));
        }
        if guard.under_maintenance(now) {
            return Err(EngineError::UnderMaintenance(room_id));
        }

        let span = patch.span.unwrap_or(current.span);
        validate_span(&span)?;
        if !actor.is_admin && patch.span.is_some() && span.start < now {
            return Err(EngineError::InvalidTimeRange("start is in the past"));
        }

        let participants = patch.participants.unwrap_or(current.participants);
        if participants == 0 {
            return Err(EngineError::LimitExceeded("participants must be at least 1"));
        }
        if participants > guard.capacity {
            return Err(EngineError::CapacityExceeded {
                requested: participants,
                capacity: guard.capacity,
            });
        }

        let title = patch.title.unwrap_or_else(|| current.title.clone());
        let chairman = patch.chairman.unwrap_or_else(|| current.chairman.clone());
        let department = patch.department.unwrap_or_else(|| current.department.clone());
        let description = patch.description.unwrap_or_else(|| current.description.clone());
        let extra_requests = patch
            .extra_requests
            .unwrap_or_else(|| current.extra_requests.clone());
        let notes = patch.notes.unwrap_or_else(|| current.notes.clone());
        validate_booking_texts(&title, &chairman, &department, &description, &extra_requests, &notes)?;

        let equipment = patch.equipment.unwrap_or_else(|| current.equipment.clone());
        if equipment.len() > MAX_EQUIPMENT_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many equipment items on booking"));
        }
        for equipment_id in &equipment {
            if !self.equipment.contains_key(equipment_id) {
                return Err(EngineError::NotFound(*equipment_id));
            }
        }

        let conflicts = conflicting_starts(&guard, &[span], Some(id));
        if !conflicts.is_empty() {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Conflict(conflicts));
        }

        let status = policy::edited_status(
            old,
            participants,
            &extra_requests,
            &notes,
            !equipment.is_empty(),
        );

        let event = Event::BookingEdited {
            id,
            room_id,
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
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        if status != old
            && let Some(b) = guard.booking(id) {
                let names = self.equipment_names(&b.equipment);
                let n = Notification::status_changed(b, old, room_id, &guard.name, &names);
                self.notify.publish(room_id, n);
            }
        Ok(())
    }

    /// Set the reminder flag and publish a Reminder notification. No-op when
    /// the booking is not approved or was already reminded, so the sweep can
    /// race itself harmlessly.
    pub async fn mark_reminded(&self, id: Ulid) -> Result<(), EngineError> {
        let (room_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        if booking.status != BookingStatus::Approved || booking.notified {
            return Ok(());
        }

        let event = Event::ReminderSent { id, room_id };
        self.persist_and_apply(&mut guard, &event).await?;

        if let Some(b) = guard.booking(id) {
            let names = self.equipment_names(&b.equipment);
            let n = Notification::reminder(b, room_id, &guard.name, &names);
            self.notify.publish(room_id, n);
        }
        Ok(())
    }

    // ── WAL compaction ───────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state: the equipment registry, one RoomCreated
    /// per room and one BookingRequested per booking (the event carries the
    /// full row, status and reminder flag included).
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.equipment.iter() {
            let e = entry.value();
            events.push(Event::EquipmentAdded {
                id: e.id,
                name: e.name.clone(),
                description: e.description.clone(),
            });
        }

        let room_ids: Vec<Ulid> = self.rooms.iter().map(|e| *e.key()).collect();
        let mut seen = HashSet::new();
        for id in room_ids {
            if !seen.insert(id) {
                continue;
            }
            let entry = match self.rooms.get(&id) {
                Some(e) => e,
                None => continue,
            };
            let rs: SharedRoomState = entry.value().clone();
            let guard = rs.try_read().expect("compact: uncontended read");

            events.push(Event::RoomCreated {
                id: guard.id,
                name: guard.name.clone(),
                capacity: guard.capacity,
                location: guard.location.clone(),
                approver: guard.approver.clone(),
                maintenance: guard.maintenance,
            });

            for b in &guard.bookings {
                events.push(Event::BookingRequested {
                    id: b.id,
                    room_id: guard.id,
                    series_id: b.series_id,
                    owner: b.owner.clone(),
                    span: b.span,
                    title: b.title.clone(),
                    participants: b.participants,
                    chairman: b.chairman.clone(),
                    department: b.department.clone(),
                    description: b.description.clone(),
                    extra_requests: b.extra_requests.clone(),
                    notes: b.notes.clone(),
                    equipment: b.equipment.clone(),
                    status: b.status,
                    notified: b.notified,
                    created_at: b.created_at,
                    updated_at: b.updated_at,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn validate_room_fields(
    name: &str,
    capacity: u32,
    maintenance: &Option<Span>,
) -> Result<(), EngineError> {
    if name.trim().is_empty() || name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("room name length"));
    }
    if capacity == 0 {
        return Err(EngineError::LimitExceeded("room capacity must be at least 1"));
    }
    if let Some(w) = maintenance
        && w.start >= w.end {
            return Err(EngineError::InvalidTimeRange(
                "maintenance window end must be after start",
            ));
        }
    Ok(())
}

fn validate_booking_texts(
    title: &str,
    chairman: &str,
    department: &str,
    description: &str,
    extra_requests: &str,
    notes: &str,
) -> Result<(), EngineError> {
    if title.trim().is_empty() || title.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("title length"));
    }
    for text in [chairman, department, description, extra_requests, notes] {
        if text.len() > MAX_TEXT_LEN {
            return Err(EngineError::LimitExceeded("text field too long"));
        }
    }
    Ok(())
}
