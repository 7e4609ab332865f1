use crate::session::Origin;
use embassy_sync::{
    blocking_mutex::raw::NoopRawMutex,
    channel::{Channel, Receiver, Sender},
};
use wire_protocols::firmware_update::{ActivationSet, FragmentReport, RequestGet};

pub const EVENT_QUEUE_SIZE: usize = 8;

pub type EventChannel = Channel<NoopRawMutex, Event, EVENT_QUEUE_SIZE>;
pub type EventSender<'a> = Sender<'a, NoopRawMutex, Event, EVENT_QUEUE_SIZE>;
pub type EventReceiver<'a> = Receiver<'a, NoopRawMutex, Event, EVENT_QUEUE_SIZE>;

/// Everything that drives the engine, inbound frames, transport
/// completions, timer expiries and the engine's own follow-ups
#[derive(Clone, Debug, defmt::Format)]
pub enum Event {
    RequestGet {
        origin: Origin,
        request: RequestGet,
    },
    /// The transport finished with the last frame sent
    TxComplete {
        delivered: bool,
    },
    FragmentReport {
        origin: Origin,
        report: FragmentReport,
    },
    TimerExpired,
    /// Holds the staged image back until an activation arrives
    InstallDeferred,
    /// Install the staged image now
    InstallNow,
    ActivationSet {
        origin: Origin,
        set: ActivationSet,
    },
}
