//! The transfer state machine.
//!
//! Every input is an [`Event`]. `dispatch` matches it against the current
//! [`State`] and runs the bound action, events that mean nothing in the
//! current state are logged and dropped.

use crate::{
    activation::{check_activation, report_for_record, report_for_set},
    cache::CacheVerdict,
    config::{Config, ConfigError, DeviceIdentity},
    error::Error,
    event::{Event, EventReceiver, EventSender},
    persist::{Phase, PersistedRecord, RecordStore},
    platform::{BootOutcome, Outbound, Platform, RetryTimer, Transport},
    request::RetryVerdict,
    reset_reason::ResetReason,
    session::{negotiate, FragmentCheck, Origin, State, UpdateSession},
};
use core::convert::Infallible;
use embassy_time::Duration;
use embedded_storage::nor_flash::{NorFlash, NorFlashError};
use wire_protocols::firmware_update::{
    ActivationSet, ActivationStatus, FragmentReport, RequestGet, RequestReport, RequestStatus,
    StatusReport, UpdateStatus, MAX_REPORT_NUMBER,
};

/// What the single timer is currently armed for
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub enum TimerPurpose {
    /// Waiting for the fragments of a `FragmentGet`
    FragmentRequest,
    /// Delay before rebooting into the installer
    Install,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, defmt::Format)]
pub struct Progress {
    /// Last accepted report number
    pub report_number: u16,
    /// Image bytes committed to flash
    pub bytes_written: u32,
}

pub struct UpdateEngine<'q, T, I, S, P, M> {
    config: Config,
    identity: DeviceIdentity,
    state: State,
    session: Option<UpdateSession>,
    transport: T,
    image: I,
    records: RecordStore<S>,
    platform: P,
    timer: M,
    armed: Option<TimerPurpose>,
    /// The final report of a session is out and its record goes once the
    /// transport is done with it
    awaiting_delivery: bool,
    /// Verified image waiting to be installed
    staged: Option<PersistedRecord>,
    events: EventSender<'q>,
}

impl<'q, T, I, S, P, M> UpdateEngine<'q, T, I, S, P, M>
where
    T: Transport,
    I: NorFlash,
    S: NorFlash,
    P: Platform,
    M: RetryTimer,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        identity: DeviceIdentity,
        transport: T,
        image: I,
        record_slot: S,
        platform: P,
        timer: M,
        events: EventSender<'q>,
    ) -> Result<Self, ConfigError> {
        config.check()?;
        Ok(Self {
            config,
            identity,
            state: State::Idle,
            session: None,
            transport,
            image,
            records: RecordStore::new(record_slot),
            platform,
            timer,
            armed: None,
            awaiting_delivery: false,
            staged: None,
            events,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn session(&self) -> Option<&UpdateSession> {
        self.session.as_ref()
    }

    pub fn staged(&self) -> Option<&PersistedRecord> {
        self.staged.as_ref()
    }

    pub fn progress(&self) -> Option<Progress> {
        self.session.as_ref().map(|s| Progress {
            report_number: s.last_report_number(),
            bytes_written: s.bytes_written(),
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn timer(&self) -> &M {
        &self.timer
    }

    /// Queues a follow-up event
    pub fn raise(&mut self, event: Event) -> Result<(), Error> {
        self.events.try_send(event).map_err(|_| Error::QueueFull)
    }

    /// Handles whatever is queued without waiting, returns the number of events handled
    pub fn poll(&mut self, events: &EventReceiver<'_>) -> Result<usize, Error> {
        let mut handled = 0;
        while let Ok(event) = events.try_receive() {
            self.dispatch(event)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Only returns on a fatal error
    pub async fn run(&mut self, events: EventReceiver<'_>) -> Result<Infallible, Error> {
        loop {
            let event = events.receive().await;
            self.dispatch(event)?;
        }
    }

    pub fn dispatch(&mut self, event: Event) -> Result<(), Error> {
        trace!("UM: {} <- {:?}", self.state, event);
        match (self.state, event) {
            (State::Idle, Event::RequestGet { origin, request }) => {
                self.request_get(origin, request)
            }
            (State::Idle, Event::TxComplete { delivered }) => self.final_report_done(delivered),
            (State::Idle, Event::InstallDeferred) => {
                self.state = State::AwaitTimeout;
                Ok(())
            }
            (State::Idle | State::AwaitTimeout, Event::InstallNow) => self.install_now(),
            (State::Idle | State::AwaitTimeout, Event::TimerExpired) => self.install_timer_expired(),
            (State::Ready, Event::TxComplete { delivered: true }) => {
                self.start_transfer();
                Ok(())
            }
            (State::Ready, Event::TxComplete { delivered: false }) => {
                warn!("UM: request report was not acknowledged");
                self.abandon()
            }
            (State::AwaitReport, Event::FragmentReport { origin, report }) => {
                self.fragment_report(origin, report)
            }
            (State::AwaitReport, Event::TimerExpired) => self.request_timer_expired(),
            (_, Event::ActivationSet { origin, set }) => {
                // Rejections are reported to the requester by activation_set
                let _ = self.activation_set(origin, &set);
                Ok(())
            }
            (state, event) => {
                debug!("UM: ignoring {:?} in {}", event, state);
                Ok(())
            }
        }
    }

    /// Handles an activation command. Only an activation of the staged image
    /// while waiting for one is accepted, the install follows after the
    /// configured delay.
    pub fn activation_set(
        &mut self,
        origin: Origin,
        set: &ActivationSet,
    ) -> Result<(), ActivationStatus> {
        let staged = match self.state {
            State::AwaitTimeout => self.staged.as_ref(),
            _ => None,
        };
        let result = check_activation(set, staged, &self.identity);
        match result {
            Ok(()) => {
                info!("UM: activation from {} accepted", origin);
                self.start_timer(TimerPurpose::Install, self.config.install_delay);
            }
            Err(status) => {
                warn!("UM: rejecting activation from {} in {}", origin, self.state);
                self.send(
                    &origin,
                    Outbound::ActivationStatusReport(report_for_set(set, status)),
                );
            }
        }
        result
    }

    /// Picks up a session persisted before the last reset and sends its
    /// outstanding report. Call once at boot before dispatching any event.
    pub fn resume(&mut self, reset_reason: ResetReason) -> Result<Option<PersistedRecord>, Error> {
        if self.state != State::Idle || self.session.is_some() {
            return Ok(None);
        }
        let record = match self.records.load_and_resume(reset_reason) {
            Some(r) => r,
            None => return Ok(None),
        };

        match record.phase {
            Phase::Receiving => {
                warn!("UM: transfer from {} was interrupted", record.origin);
                let report = StatusReport::new(UpdateStatus::UnableToReceive);
                self.send_final(&record.origin, Outbound::StatusReport(report))?;
            }
            Phase::Installing if record.success_reported => {
                let outcome = self.platform.boot_outcome(record.target);
                info!(
                    "UM: install outcome for target {}: {:?}, success was already reported",
                    record.target, outcome
                );
                self.records.clear()?;
            }
            Phase::Installing => {
                let outcome = self.platform.boot_outcome(record.target);
                info!(
                    "UM: install outcome for target {}: {:?}",
                    record.target, outcome
                );
                let applied = outcome == BootOutcome::Applied;
                let frame = if record.activation_requested {
                    let status = if applied {
                        ActivationStatus::Completed
                    } else {
                        ActivationStatus::ErrorActivating
                    };
                    Outbound::ActivationStatusReport(report_for_record(
                        &record,
                        &self.identity,
                        status,
                    ))
                } else if applied {
                    Outbound::StatusReport(StatusReport::new(UpdateStatus::SuccessRestart))
                } else {
                    Outbound::StatusReport(StatusReport::new(UpdateStatus::InvalidImage))
                };
                self.send_final(&record.origin, frame)?;
            }
            Phase::Verified => {
                info!("UM: verified image for target {} is still staged", record.target);
                self.staged = Some(record);
                if self.config.restart_after_update {
                    self.start_timer(TimerPurpose::Install, self.config.install_delay);
                }
            }
            Phase::AwaitingActivation => {
                info!("UM: staged image for target {} awaits activation", record.target);
                self.staged = Some(record);
                self.state = State::AwaitTimeout;
            }
        }
        Ok(Some(record))
    }

    fn request_get(&mut self, origin: Origin, request: RequestGet) -> Result<(), Error> {
        let status = match negotiate(&request, &self.identity, &self.config, I::WRITE_SIZE) {
            Err(status) => status,
            Ok(_) if !self.platform.authorize_update(&origin, &request) => {
                RequestStatus::RequiresAuthentication
            }
            Ok(fragment_size) => return self.accept_request(origin, request, fragment_size),
        };
        warn!("UM: rejecting request from {}, {}", origin, status);
        self.send(&origin, Outbound::RequestReport(RequestReport { status }));
        Ok(())
    }

    fn accept_request(
        &mut self,
        origin: Origin,
        request: RequestGet,
        fragment_size: u16,
    ) -> Result<(), Error> {
        let capacity = self.image.capacity() as u32;
        if let Err(e) = self.image.erase(0, capacity) {
            warn!("UM: failed to erase the image area. {:?}", e.kind());
            let status = RequestStatus::NotUpgradable;
            self.send(&origin, Outbound::RequestReport(RequestReport { status }));
            return Ok(());
        }

        // Whatever was staged is gone with the erase
        self.stop_timer();
        self.staged = None;
        self.awaiting_delivery = false;

        let session = UpdateSession::new(origin, &request, fragment_size, &self.config);
        if let Err(e) = self.records.persist(&session.record(Phase::Receiving)) {
            error!("UM: failed to persist the session record. {:?}", e);
            return Err(e.into());
        }
        info!(
            "UM: accepted update of target {} from {}, {} byte fragments, {} per batch",
            request.target,
            origin,
            fragment_size,
            session.cache().reports_in_batch()
        );
        self.session = Some(session);
        self.state = State::Ready;

        let status = RequestStatus::Valid;
        if !self.send(&origin, Outbound::RequestReport(RequestReport { status })) {
            return self.abandon();
        }
        Ok(())
    }

    fn start_transfer(&mut self) {
        self.state = State::AwaitReport;
        self.request_fragments();
    }

    /// Sends the `FragmentGet` for the rest of the batch and (re)arms the timer
    fn request_fragments(&mut self) {
        let (origin, get, timeout) = match self.session.as_ref() {
            Some(s) => (*s.origin(), s.next_get(), s.requests().timeout_window()),
            None => return,
        };
        debug!(
            "UM: requesting {} reports from {}",
            get.reports, get.report_number
        );
        self.send(&origin, Outbound::FragmentGet(get));
        self.start_timer(TimerPurpose::FragmentRequest, timeout);
    }

    fn fragment_report(&mut self, origin: Origin, report: FragmentReport) -> Result<(), Error> {
        let check = match self.session.as_ref() {
            Some(s) if *s.origin() == origin => s.check_fragment(&report),
            Some(_) => {
                debug!("UM: ignoring fragment from {}", origin);
                return Ok(());
            }
            None => return Ok(()),
        };

        match check {
            FragmentCheck::Accept => self.accept_fragment(report),
            FragmentCheck::Duplicate => {
                trace!("UM: dropping duplicate report {}", report.report_number);
                Ok(())
            }
            FragmentCheck::Defect(defect) => {
                debug!(
                    "UM: report {} rejected, {:?}",
                    report.report_number, defect
                );
                self.retry()
            }
        }
    }

    fn accept_fragment(&mut self, report: FragmentReport) -> Result<(), Error> {
        let (accepted, intact, timeout) = match self.session.as_mut() {
            Some(s) => {
                let accepted = s.accept_fragment(&report);
                let intact = !report.last || s.image_is_intact();
                (accepted, intact, s.requests().timeout_window())
            }
            None => return Ok(()),
        };

        let verdict = match accepted {
            Ok(v) => v,
            Err(_) => return self.fail_session(UpdateStatus::InsufficientMemory),
        };

        if report.last {
            if !intact {
                warn!("UM: image checksum mismatch");
                return self.fail_session(UpdateStatus::ChecksumError);
            }
            if self.flush()? {
                return self.image_complete();
            }
            return Ok(());
        }

        if report.report_number >= MAX_REPORT_NUMBER {
            warn!("UM: image exceeds the report number space");
            return self.fail_session(UpdateStatus::InsufficientMemory);
        }

        match verdict {
            CacheVerdict::NeedMore => {
                self.start_timer(TimerPurpose::FragmentRequest, timeout);
            }
            CacheVerdict::FlushNow => {
                if self.flush()? {
                    self.request_fragments();
                }
            }
        }
        Ok(())
    }

    /// Writes the cached batch. A failed write ends the session.
    fn flush(&mut self) -> Result<bool, Error> {
        let result = match self.session.as_mut() {
            Some(s) => s.flush(&mut self.image),
            None => return Ok(false),
        };
        match result {
            Ok(flushed) => {
                debug!(
                    "UM: wrote {} bytes at 0x{:X}",
                    flushed.len, flushed.offset
                );
                Ok(true)
            }
            Err(e) => {
                warn!("UM: image write failed. {:?}", e);
                self.fail_session(UpdateStatus::InsufficientMemory)?;
                Ok(false)
            }
        }
    }

    fn image_complete(&mut self) -> Result<(), Error> {
        self.stop_timer();
        let (target, len) = match self.session.as_ref() {
            Some(s) => (s.target(), s.bytes_written()),
            None => return Ok(()),
        };
        if self.platform.verify_image(target, len).is_err() {
            warn!("UM: image for target {} failed verification", target);
            return self.fail_session(UpdateStatus::InvalidImage);
        }

        let session = match self.session.take() {
            Some(s) => s,
            None => return Ok(()),
        };
        let origin = *session.origin();
        self.state = State::Idle;
        info!("UM: image for target {} verified, {} bytes", target, len);

        if session.activation_requested() {
            let record = session.record(Phase::AwaitingActivation);
            self.records.persist(&record)?;
            self.staged = Some(record);
            self.state = State::AwaitTimeout;
            let report = StatusReport::new(UpdateStatus::SuccessWaitingActivation);
            self.send(&origin, Outbound::StatusReport(report));
            return Ok(());
        }

        // The record leaves Receiving before the success report goes out
        let record = PersistedRecord {
            success_reported: true,
            ..session.record(Phase::Verified)
        };
        self.records.persist(&record)?;
        self.staged = Some(record);
        if self.config.restart_after_update {
            let report = StatusReport {
                status: UpdateStatus::SuccessRestart,
                wait_time: self.config.restart_wait_time_sec,
            };
            self.send(&origin, Outbound::StatusReport(report));
            self.start_timer(TimerPurpose::Install, self.config.install_delay);
        } else {
            let report = StatusReport::new(UpdateStatus::SuccessStored);
            self.send_final(&origin, Outbound::StatusReport(report))?;
        }
        Ok(())
    }

    fn install_now(&mut self) -> Result<(), Error> {
        let staged = match self.staged.take() {
            Some(r) => r,
            None => {
                warn!("UM: no staged image to install");
                return Ok(());
            }
        };
        self.stop_timer();
        self.state = State::Idle;

        let record = PersistedRecord {
            phase: Phase::Installing,
            ..staged
        };
        self.records.persist(&record)?;

        info!("UM: rebooting into the installer for target {}", record.target);
        if self.platform.reboot_into_installer(record.target).is_err() {
            error!("UM: reboot into the installer failed");
            if record.success_reported {
                // Already reported, keep the image for another install attempt
                self.records.persist(&staged)?;
                self.staged = Some(staged);
            } else {
                let report = report_for_record(
                    &record,
                    &self.identity,
                    ActivationStatus::ErrorActivating,
                );
                self.send_final(&record.origin, Outbound::ActivationStatusReport(report))?;
            }
        }
        Ok(())
    }

    fn install_timer_expired(&mut self) -> Result<(), Error> {
        match self.armed.take() {
            Some(TimerPurpose::Install) => self.install_now(),
            armed => {
                debug!("UM: stale timer expiry ({:?})", armed);
                Ok(())
            }
        }
    }

    fn request_timer_expired(&mut self) -> Result<(), Error> {
        match self.armed.take() {
            Some(TimerPurpose::FragmentRequest) => {
                warn!("UM: fragment request timed out");
                self.retry()
            }
            armed => {
                debug!("UM: stale timer expiry ({:?})", armed);
                Ok(())
            }
        }
    }

    fn retry(&mut self) -> Result<(), Error> {
        let verdict = match self.session.as_mut() {
            Some(s) => s.requests_mut().on_failure(),
            None => return Ok(()),
        };
        match verdict {
            RetryVerdict::Retry => {
                self.request_fragments();
                Ok(())
            }
            RetryVerdict::Exhausted => {
                warn!("UM: retries exhausted");
                self.fail_session(UpdateStatus::UnableToReceive)
            }
        }
    }

    /// Ends the session with a failure status
    fn fail_session(&mut self, status: UpdateStatus) -> Result<(), Error> {
        self.stop_timer();
        self.state = State::Idle;
        match self.session.take() {
            Some(session) => {
                warn!("UM: session from {} failed, {}", session.origin(), status);
                let report = StatusReport::new(status);
                self.send_final(session.origin(), Outbound::StatusReport(report))
            }
            None => Ok(()),
        }
    }

    /// Drops the session without telling anyone
    fn abandon(&mut self) -> Result<(), Error> {
        warn!("UM: abandoning session");
        self.stop_timer();
        self.session = None;
        self.state = State::Idle;
        self.records.clear()?;
        Ok(())
    }

    fn final_report_done(&mut self, delivered: bool) -> Result<(), Error> {
        if !self.awaiting_delivery {
            trace!("UM: ignoring tx completion");
            return Ok(());
        }
        self.awaiting_delivery = false;
        if !delivered {
            warn!("UM: final report was not acknowledged");
        }
        self.records.clear()?;
        Ok(())
    }

    /// Sends the last report of a session. The record goes once the
    /// transport is done with it, or right away if it couldn't be queued.
    fn send_final(&mut self, to: &Origin, frame: Outbound) -> Result<(), Error> {
        if self.send(to, frame) {
            self.awaiting_delivery = true;
        } else {
            self.records.clear()?;
        }
        Ok(())
    }

    fn send(&mut self, to: &Origin, frame: Outbound) -> bool {
        match self.transport.send(to, frame) {
            Ok(()) => true,
            Err(e) => {
                warn!("UM: failed to send {:?} to {}. {:?}", frame, to, e);
                false
            }
        }
    }

    fn start_timer(&mut self, purpose: TimerPurpose, timeout: Duration) {
        self.timer.start(timeout);
        self.armed = Some(purpose);
    }

    fn stop_timer(&mut self) {
        self.timer.stop();
        self.armed = None;
    }
}
