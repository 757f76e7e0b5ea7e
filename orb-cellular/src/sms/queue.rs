use super::SmsRecord;
use tracing::{debug, info};

/// What the send queue needs from the service.
#[cfg_attr(test, mockall::automock)]
pub trait SendEffects {
    fn is_online(&self) -> bool;
    fn is_sim_ready(&self) -> bool;
    fn send(&mut self, record: &SmsRecord);
    /// Asks the database for the next queued record.
    fn query_next(&mut self);
}

/// Drives outbox draining: one database query per notification, one send and one
/// follow-up query per record, until the database reports no more records.
#[derive(Debug, Default)]
pub struct SendQueue {
    delayed: bool,
    last_sent: Option<u32>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_delayed(&self) -> bool {
        self.delayed
    }

    pub fn handle_db_notification(&mut self, fx: &mut dyn SendEffects) {
        fx.query_next();
    }

    pub fn handle_incoming_db_record(
        &mut self,
        fx: &mut dyn SendEffects,
        record: &SmsRecord,
        send_on_delay: bool,
    ) {
        if send_on_delay {
            debug!("delaying sms {}", record.id);
            self.delayed = true;
            return;
        }

        if !fx.is_online() || !fx.is_sim_ready() {
            info!("cannot send sms {} now, leaving it queued", record.id);
            return;
        }

        if self.last_sent == Some(record.id) {
            debug!("sms {} already sent in this cycle", record.id);
            return;
        }

        fx.send(record);
        self.last_sent = Some(record.id);
        fx.query_next();
    }

    pub fn handle_no_more_db_records(&mut self) {
        self.last_sent = None;
    }

    pub fn send_message_if_delayed(&mut self, fx: &mut dyn SendEffects) {
        if std::mem::take(&mut self.delayed) {
            fx.query_next();
        }
    }
}
