// libs/appointment-cell/src/services/resolver.rs
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use shared_models::auth::Actor;
use shared_utils::clock::Clock;
use slot_cell::services::{HoldManager, SlotStore};
use slot_cell::{ClinicZone, SlotError, SlotState, TimeSlot};

use crate::models::{
    Appointment, AppointmentChange, AppointmentError, AppointmentPatch, AppointmentStatus, BookingPolicy,
    CancelOutcome, CancelRequest, CancelledBy, ChangeAction, CreateAppointmentRequest, NewAppointment,
    NewAppointmentChange, PaymentOutcome, PaymentSource, ReconciliationReport, RescheduleOutcome,
    RescheduleRequest,
};
use crate::services::collaborators::{MeetingProvisioner, NotificationDispatcher, NotificationTrigger};
use crate::services::lifecycle::AppointmentLifecycleService;
use crate::services::repository::AppointmentRepository;

/// Moves slot availability and appointment status together.
///
/// Every slot write is a compare-and-set in the slot store. Appointment writes are
/// conditioned on the version that was read, and a lost appointment write undoes the
/// slot write that preceded it.
#[derive(Clone)]
pub struct BookingConflictResolver {
    repo: Arc<dyn AppointmentRepository>,
    store: SlotStore,
    holds: HoldManager,
    clock: Arc<dyn Clock>,
    zone: ClinicZone,
    policy: BookingPolicy,
    lifecycle: AppointmentLifecycleService,
    notifier: Arc<dyn NotificationDispatcher>,
    meetings: Arc<dyn MeetingProvisioner>,
}

impl BookingConflictResolver {
    pub fn new(
        repo: Arc<dyn AppointmentRepository>,
        slots: &SlotState,
        notifier: Arc<dyn NotificationDispatcher>,
        meetings: Arc<dyn MeetingProvisioner>,
        policy: BookingPolicy,
    ) -> Self {
        Self {
            repo,
            store: slots.store.clone(),
            holds: slots.holds.clone(),
            clock: slots.clock.clone(),
            zone: slots.zone,
            policy,
            lifecycle: AppointmentLifecycleService::new(),
            notifier,
            meetings,
        }
    }

    async fn load(&self, appointment_id: Uuid) -> Result<Appointment, AppointmentError> {
        self.repo.get(appointment_id).await?.ok_or(AppointmentError::NotFound)
    }

    async fn load_for(&self, actor: &Actor, appointment_id: Uuid) -> Result<Appointment, AppointmentError> {
        let appointment = self.load(appointment_id).await?;
        if !appointment.is_participant(actor) {
            return Err(AppointmentError::Forbidden(
                "You don't have permission to access this appointment".to_string(),
            ));
        }
        Ok(appointment)
    }

    // ==========================================================================
    // LIFECYCLE
    // ==========================================================================

    #[instrument(skip(self, request), fields(slot_id = %request.slot_id))]
    pub async fn create_appointment(
        &self,
        actor: &Actor,
        request: CreateAppointmentRequest,
    ) -> Result<Appointment, AppointmentError> {
        if !request.price.is_finite() || request.price < 0.0 {
            return Err(AppointmentError::Validation("price must be a non-negative amount".to_string()));
        }

        let slot = self.store.get_slot(request.slot_id).await?;
        if slot.doctor_id != request.doctor_id {
            return Err(AppointmentError::Validation("slot does not belong to this doctor".to_string()));
        }
        if !slot.is_available {
            return Err(AppointmentError::SlotUnavailable("slot is already booked".to_string()));
        }
        if self.holds.is_held_by_other(slot.id, request.session_id.as_deref()).await? {
            return Err(AppointmentError::SlotUnavailable(
                "this slot is being booked by someone else".to_string(),
            ));
        }

        let appointment_date = self.zone.slot_start(&slot);
        if appointment_date <= self.clock.now() {
            return Err(AppointmentError::Validation("slot has already started".to_string()));
        }

        let appointment = self
            .repo
            .insert(NewAppointment {
                patient_id: actor.user_id,
                doctor_id: slot.doctor_id,
                slot_id: Some(slot.id),
                appointment_date,
                price: request.price,
            })
            .await?;

        info!("Appointment {} created for slot {}", appointment.id, slot.id);
        Ok(appointment)
    }

    pub async fn get_appointment(&self, actor: &Actor, appointment_id: Uuid) -> Result<Appointment, AppointmentError> {
        self.load_for(actor, appointment_id).await
    }

    pub async fn list_changes(
        &self,
        actor: &Actor,
        appointment_id: Uuid,
    ) -> Result<Vec<AppointmentChange>, AppointmentError> {
        self.load_for(actor, appointment_id).await?;
        self.repo.list_changes(appointment_id).await
    }

    #[instrument(skip(self, payment_reference))]
    pub async fn begin_checkout(
        &self,
        actor: &Actor,
        appointment_id: Uuid,
        payment_reference: String,
    ) -> Result<Appointment, AppointmentError> {
        if payment_reference.trim().is_empty() {
            return Err(AppointmentError::Validation("payment reference is required".to_string()));
        }

        let appointment = self.load(appointment_id).await?;
        if !actor.is_admin() && actor.user_id != appointment.patient_id {
            return Err(AppointmentError::Forbidden("Only the patient can pay for this appointment".to_string()));
        }
        self.lifecycle
            .validate_status_transition(&appointment.status, &AppointmentStatus::PendingPayment)?;

        let patch = AppointmentPatch {
            status: Some(AppointmentStatus::PendingPayment),
            payment_reference: Some(payment_reference),
            ..AppointmentPatch::default()
        };
        self.repo
            .update_if(appointment_id, appointment.version(), patch)
            .await?
            .ok_or(AppointmentError::ConcurrentModification)
    }

    /// Idempotent for repeated failure notices. A failure notice that arrives after the
    /// appointment was paid, completed or cancelled changes nothing.
    pub async fn mark_payment_failed(
        &self,
        appointment_id: Uuid,
        payment_reference: Option<String>,
    ) -> Result<Appointment, AppointmentError> {
        let appointment = self.load(appointment_id).await?;
        if appointment.status == AppointmentStatus::PaymentFailed {
            return Ok(appointment);
        }
        if appointment.status.holds_slot() || appointment.status == AppointmentStatus::Cancelled {
            info!(
                "Ignoring late payment failure for appointment {} in status {}",
                appointment_id, appointment.status
            );
            return Ok(appointment);
        }
        self.lifecycle
            .validate_status_transition(&appointment.status, &AppointmentStatus::PaymentFailed)?;

        let patch = AppointmentPatch {
            status: Some(AppointmentStatus::PaymentFailed),
            payment_reference,
            ..AppointmentPatch::default()
        };
        let failed = self
            .repo
            .update_if(appointment_id, appointment.version(), patch)
            .await?
            .ok_or(AppointmentError::ConcurrentModification)?;

        warn!("Payment failed for appointment {}", appointment_id);
        Ok(failed)
    }

    pub async fn complete_appointment(
        &self,
        actor: &Actor,
        appointment_id: Uuid,
    ) -> Result<Appointment, AppointmentError> {
        let appointment = self.load(appointment_id).await?;
        if !actor.is_admin() && actor.user_id != appointment.doctor_id {
            return Err(AppointmentError::Forbidden(
                "Only the doctor can complete this appointment".to_string(),
            ));
        }
        self.lifecycle
            .validate_status_transition(&appointment.status, &AppointmentStatus::Completed)?;

        self.repo
            .update_if(
                appointment_id,
                appointment.version(),
                AppointmentPatch::status(AppointmentStatus::Completed),
            )
            .await?
            .ok_or(AppointmentError::ConcurrentModification)
    }

    // ==========================================================================
    // PAYMENT CONFIRMATION
    // ==========================================================================

    /// Client confirmation and the gateway webhook both land here. Whichever arrives
    /// first pays the appointment; the other sees `already_paid`.
    #[instrument(skip(self, payment_reference))]
    pub async fn confirm_payment(
        &self,
        source: PaymentSource,
        appointment_id: Uuid,
        payment_reference: Option<String>,
    ) -> Result<PaymentOutcome, AppointmentError> {
        let appointment = self.load(appointment_id).await?;
        if let PaymentSource::Client(actor) = source {
            if !actor.is_admin() && actor.user_id != appointment.patient_id {
                return Err(AppointmentError::Forbidden(
                    "Only the patient can confirm this payment".to_string(),
                ));
            }
        }

        if appointment.status == AppointmentStatus::Cancelled {
            error!(
                "Payment {:?} arrived for cancelled appointment {}, refund required",
                payment_reference, appointment_id
            );
            return Err(AppointmentError::PaidAfterCancellation);
        }
        if appointment.status.holds_slot() {
            debug!("Appointment {} already {}, confirmation is a no-op", appointment_id, appointment.status);
            return Ok(PaymentOutcome {
                appointment,
                already_paid: true,
                needs_reconciliation: false,
            });
        }
        self.lifecycle
            .validate_status_transition(&appointment.status, &AppointmentStatus::Paid)?;

        let mut locked: Option<Uuid> = None;
        if let Some(slot) = self.locate_slot(&appointment).await? {
            match self.store.lock_slot(slot.id).await {
                Ok(_) => locked = Some(slot.id),
                Err(SlotError::SlotUnavailable(_)) => {
                    return self.converge_after_lost_lock(appointment_id, slot.id).await;
                }
                Err(SlotError::NotFound(_)) => {
                    warn!("Slot {} vanished while confirming appointment {}", slot.id, appointment_id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let patch = AppointmentPatch {
            status: Some(AppointmentStatus::Paid),
            slot_id: locked,
            payment_reference: payment_reference.filter(|r| !r.trim().is_empty()),
            ..AppointmentPatch::default()
        };
        let paid = match self.repo.update_if(appointment_id, appointment.version(), patch).await {
            Ok(Some(paid)) => paid,
            Ok(None) => {
                self.restore_released(locked).await;
                return match self.load(appointment_id).await? {
                    current if current.status.holds_slot() => Ok(PaymentOutcome {
                        appointment: current,
                        already_paid: true,
                        needs_reconciliation: false,
                    }),
                    _ => Err(AppointmentError::ConcurrentModification),
                };
            }
            Err(e) => {
                self.restore_released(locked).await;
                return Err(e);
            }
        };

        let needs_reconciliation = locked.is_none();
        if needs_reconciliation {
            // Payment is never rolled back for slot bookkeeping
            error!(
                "Appointment {} paid without a slot to lock (slot {:?}), needs reconciliation",
                appointment_id, appointment.slot_id
            );
        } else {
            info!("Appointment {} paid, slot {:?} locked", appointment_id, locked);
        }

        if let Some(slot_id) = locked {
            if let Err(e) = self.holds.consume(slot_id).await {
                warn!("Could not drop hold on paid slot {}: {}", slot_id, e);
            }
        }
        self.notify(NotificationTrigger::BookingConfirmed, appointment_id).await;
        if let Err(e) = self.meetings.provision(appointment_id).await {
            warn!("Meeting provisioning failed for appointment {}: {}", appointment_id, e);
        }

        Ok(PaymentOutcome {
            appointment: paid,
            already_paid: false,
            needs_reconciliation,
        })
    }

    /// The referenced slot, or the doctor's slot starting at the appointment time.
    async fn locate_slot(&self, appointment: &Appointment) -> Result<Option<TimeSlot>, AppointmentError> {
        match appointment.slot_id {
            Some(slot_id) => match self.store.get_slot(slot_id).await {
                Ok(slot) => Ok(Some(slot)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e.into()),
            },
            None => {
                let local = self.zone.to_local(appointment.appointment_date);
                Ok(self
                    .store
                    .find_slot_at(appointment.doctor_id, local.date(), local.time())
                    .await?)
            }
        }
    }

    /// A confirmation of the same appointment may have locked the slot and not yet
    /// written the appointment. Wait for it briefly before calling the slot taken.
    async fn converge_after_lost_lock(
        &self,
        appointment_id: Uuid,
        slot_id: Uuid,
    ) -> Result<PaymentOutcome, AppointmentError> {
        for attempt in 1..=self.policy.max_retry_attempts {
            let current = self.load(appointment_id).await?;
            if current.status.holds_slot() {
                debug!("Concurrent confirmation already paid appointment {}", appointment_id);
                return Ok(PaymentOutcome {
                    appointment: current,
                    already_paid: true,
                    needs_reconciliation: false,
                });
            }

            let taken_by_other = self
                .repo
                .find_by_slot(slot_id)
                .await?
                .iter()
                .any(|a| a.id != appointment_id && a.status.holds_slot());
            if taken_by_other || attempt == self.policy.max_retry_attempts {
                break;
            }

            debug!("Slot {} locked but appointment {} not yet paid, retrying {}/{}",
                   slot_id, appointment_id, attempt, self.policy.max_retry_attempts);
            tokio::time::sleep(self.policy.retry_backoff * attempt).await;
        }

        warn!(
            "Slot {} was taken before appointment {} could be paid, payment must be refunded",
            slot_id, appointment_id
        );
        Err(AppointmentError::SlotUnavailable(
            "slot no longer available, payment will be refunded".to_string(),
        ))
    }

    async fn restore_released(&self, locked: Option<Uuid>) {
        if let Some(slot_id) = locked {
            if let Err(e) = self.store.release_slot(slot_id).await {
                error!("Could not release slot {} after failed payment write: {}", slot_id, e);
            }
        }
    }

    // ==========================================================================
    // RESCHEDULE AND CANCEL
    // ==========================================================================

    #[instrument(skip(self, request), fields(new_slot_id = %request.new_slot_id))]
    pub async fn reschedule(
        &self,
        actor: &Actor,
        appointment_id: Uuid,
        request: RescheduleRequest,
    ) -> Result<RescheduleOutcome, AppointmentError> {
        if request.reason.trim().is_empty() {
            return Err(AppointmentError::Validation("a reason is required to reschedule".to_string()));
        }

        let appointment = self.load_for(actor, appointment_id).await?;
        if appointment.status == AppointmentStatus::Cancelled {
            return Err(AppointmentError::AlreadyCancelled);
        }

        let is_admin = actor.is_admin();
        if !is_admin && appointment.reschedule_count >= self.policy.reschedule_limit {
            return Err(AppointmentError::RescheduleLimitReached);
        }
        let within_window = self.policy.within_change_window(&appointment, self.clock.now());
        if within_window && !is_admin {
            return Err(AppointmentError::ChangeWindowClosed);
        }
        self.lifecycle.validate_reschedule(&appointment.status)?;

        if appointment.slot_id == Some(request.new_slot_id) {
            return Err(AppointmentError::Validation("appointment already uses this slot".to_string()));
        }
        let new_slot = self.store.get_slot(request.new_slot_id).await?;
        if new_slot.doctor_id != appointment.doctor_id {
            return Err(AppointmentError::Validation("slot does not belong to this doctor".to_string()));
        }
        if self.holds.is_held_by_other(new_slot.id, None).await? {
            return Err(AppointmentError::SlotUnavailable(
                "this slot is being booked by someone else".to_string(),
            ));
        }

        // Only a paid appointment owns its slot; unpaid ones just point at the new one
        let moves_slot = appointment.status == AppointmentStatus::Paid;
        if moves_slot {
            match appointment.slot_id {
                Some(old_slot) => self.store.swap_availability(old_slot, new_slot.id).await?,
                None => {
                    self.store.lock_slot(new_slot.id).await?;
                }
            }
        } else if !new_slot.is_available {
            return Err(AppointmentError::SlotUnavailable("slot no longer available".to_string()));
        }

        let new_date = self.zone.slot_start(&new_slot);
        let patch = AppointmentPatch {
            slot_id: Some(new_slot.id),
            appointment_date: Some(new_date),
            reschedule_count: Some(appointment.reschedule_count + 1),
            ..AppointmentPatch::default()
        };
        let updated = match self.repo.update_if(appointment_id, appointment.version(), patch).await {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                if moves_slot {
                    self.undo_swap(appointment.slot_id, new_slot.id).await;
                }
                return Err(AppointmentError::ConcurrentModification);
            }
            Err(e) => {
                if moves_slot {
                    self.undo_swap(appointment.slot_id, new_slot.id).await;
                }
                return Err(e);
            }
        };

        self.log_change(NewAppointmentChange {
            appointment_id,
            action: ChangeAction::Reschedule,
            actor_id: actor.user_id,
            actor_role: actor.role,
            reason: Some(request.reason),
            before: json!({
                "slot_id": appointment.slot_id,
                "appointment_date": appointment.appointment_date,
                "reschedule_count": appointment.reschedule_count,
                "slot_released": moves_slot && appointment.slot_id.is_some(),
            }),
            after: json!({
                "slot_id": updated.slot_id,
                "appointment_date": updated.appointment_date,
                "reschedule_count": updated.reschedule_count,
                "slot_locked": moves_slot,
            }),
        })
        .await;
        self.notify(NotificationTrigger::Rescheduled, appointment_id).await;

        let is_admin_override = is_admin && within_window;
        if is_admin_override {
            info!("Admin {} rescheduled appointment {} inside the change window", actor.user_id, appointment_id);
        }

        Ok(RescheduleOutcome {
            appointment: updated,
            is_admin_override,
        })
    }

    async fn undo_swap(&self, old_slot: Option<Uuid>, new_slot: Uuid) {
        let undone = match old_slot {
            Some(old_slot) => self.store.swap_availability(new_slot, old_slot).await,
            None => self.store.release_slot(new_slot).await.map(|_| ()),
        };
        if let Err(e) = undone {
            error!(
                "Could not move booking back from slot {} to {:?}: {}, needs reconciliation",
                new_slot, old_slot, e
            );
        }
    }

    #[instrument(skip(self, request))]
    pub async fn cancel(
        &self,
        actor: &Actor,
        appointment_id: Uuid,
        request: CancelRequest,
    ) -> Result<CancelOutcome, AppointmentError> {
        if request.reason.trim().is_empty() {
            return Err(AppointmentError::Validation("a cancellation reason is required".to_string()));
        }

        let appointment = self.load_for(actor, appointment_id).await?;
        if appointment.status == AppointmentStatus::Cancelled {
            return Err(AppointmentError::AlreadyCancelled);
        }

        let is_admin = actor.is_admin();
        let now = self.clock.now();
        let within_window = self.policy.within_change_window(&appointment, now);
        if within_window && !is_admin {
            return Err(AppointmentError::ChangeWindowClosed);
        }
        self.lifecycle
            .validate_status_transition(&appointment.status, &AppointmentStatus::Cancelled)?;

        // Decided independently of the admin override
        let refund_eligible = self.policy.refund_eligible(&appointment, now);
        let cancelled_by = CancelledBy::for_actor(actor, &appointment);

        let patch = AppointmentPatch {
            status: Some(AppointmentStatus::Cancelled),
            cancel_reason: Some(Some(request.reason.clone())),
            cancelled_by: Some(Some(cancelled_by)),
            ..AppointmentPatch::default()
        };
        let cancelled = self
            .repo
            .update_if(appointment_id, appointment.version(), patch)
            .await?
            .ok_or(AppointmentError::ConcurrentModification)?;

        let releases_slot = appointment.status.holds_slot();
        if let Some(slot_id) = appointment.slot_id.filter(|_| releases_slot) {
            match self.store.release_slot(slot_id).await {
                Ok(_) => debug!("Released slot {} of cancelled appointment {}", slot_id, appointment_id),
                Err(e) if e.is_not_found() => {
                    debug!("Slot {} of cancelled appointment {} is already gone", slot_id, appointment_id)
                }
                Err(e) => {
                    let restore = AppointmentPatch::uncancel(appointment.status);
                    if let Err(undo) = self.repo.update_if(appointment_id, cancelled.version(), restore).await {
                        error!("Could not restore appointment {} after failed release: {}", appointment_id, undo);
                    }
                    return Err(e.into());
                }
            }
        }

        self.log_change(NewAppointmentChange {
            appointment_id,
            action: ChangeAction::Cancel,
            actor_id: actor.user_id,
            actor_role: actor.role,
            reason: Some(request.reason),
            before: json!({
                "status": appointment.status,
                "slot_id": appointment.slot_id,
            }),
            after: json!({
                "status": cancelled.status,
                "cancelled_by": cancelled_by,
                "slot_released": releases_slot && appointment.slot_id.is_some(),
                "refund_eligible": refund_eligible,
            }),
        })
        .await;
        self.notify(NotificationTrigger::Cancelled, appointment_id).await;

        info!(
            "Appointment {} cancelled by {:?}, refund eligible: {}",
            appointment_id, cancelled_by, refund_eligible
        );
        Ok(CancelOutcome {
            appointment: cancelled,
            refund_eligible,
            is_admin_override: is_admin && within_window,
        })
    }

    // ==========================================================================
    // RECONCILIATION
    // ==========================================================================

    /// Locks any slot still available under a paid appointment and reports slots that are gone.
    #[instrument(skip(self))]
    pub async fn reconcile_slots(&self, actor: &Actor) -> Result<ReconciliationReport, AppointmentError> {
        if !actor.is_admin() {
            return Err(AppointmentError::Forbidden("Admin access required".to_string()));
        }

        let mut report = ReconciliationReport::default();
        for appointment in self.repo.list_by_status(AppointmentStatus::Paid).await? {
            let Some(slot_id) = appointment.slot_id else {
                continue;
            };
            report.examined += 1;

            match self.store.lock_slot(slot_id).await {
                Ok(_) => {
                    warn!("Re-locked slot {} under paid appointment {}", slot_id, appointment.id);
                    report.locked += 1;
                }
                Err(SlotError::SlotUnavailable(_)) => report.already_locked += 1,
                Err(SlotError::NotFound(_)) => {
                    error!("Paid appointment {} references missing slot {}", appointment.id, slot_id);
                    report.missing_slots.push(slot_id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            "Reconciled {} paid appointments: {} locked, {} missing slots",
            report.examined,
            report.locked,
            report.missing_slots.len()
        );
        Ok(report)
    }

    // ==========================================================================
    // SIDE EFFECTS
    // ==========================================================================

    async fn notify(&self, trigger: NotificationTrigger, appointment_id: Uuid) {
        if let Err(e) = self.notifier.dispatch(trigger, appointment_id).await {
            warn!("Notification {} for appointment {} failed: {}", trigger.code(), appointment_id, e);
        }
    }

    async fn log_change(&self, change: NewAppointmentChange) {
        let appointment_id = change.appointment_id;
        if let Err(e) = self.repo.record_change(change).await {
            error!("Could not record change for appointment {}: {}", appointment_id, e);
        }
    }
}
