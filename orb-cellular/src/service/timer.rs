use super::Event;
use std::time::Duration;
use tokio::{task::JoinHandle, time};

/// Periodic tasks posting tick events back into the service mailbox.
#[derive(Debug, Default)]
pub struct Timers {
    connection: Option<JoinHandle<()>>,
    call_poll: Option<JoinHandle<()>>,
    sim_select: Option<JoinHandle<()>>,
}

impl Timers {
    pub fn start_connection(&mut self, period: Duration, mailbox: flume::Sender<Event>) {
        if self.connection.is_none() {
            self.connection = Some(spawn_ticker(period, mailbox, Event::ConnectionTick));
        }
    }

    pub fn stop_connection(&mut self) {
        if let Some(handle) = self.connection.take() {
            handle.abort();
        }
    }

    pub fn is_connection_running(&self) -> bool {
        self.connection.is_some()
    }

    pub fn start_call_poll(&mut self, period: Duration, mailbox: flume::Sender<Event>) {
        if self.call_poll.is_none() {
            self.call_poll = Some(spawn_ticker(period, mailbox, Event::CallPollTick));
        }
    }

    pub fn stop_call_poll(&mut self) {
        if let Some(handle) = self.call_poll.take() {
            handle.abort();
        }
    }

    /// Posts a single [`Event::SimTimer`] after `delay`, replacing a pending one.
    pub fn start_sim_select(&mut self, delay: Duration, mailbox: flume::Sender<Event>) {
        self.stop_sim_select();
        self.sim_select = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = mailbox.send_async(Event::SimTimer).await;
        }));
    }

    pub fn stop_sim_select(&mut self) {
        if let Some(handle) = self.sim_select.take() {
            handle.abort();
        }
    }

    pub fn stop_all(&mut self) {
        self.stop_connection();
        self.stop_call_poll();
        self.stop_sim_select();
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn spawn_ticker(period: Duration, mailbox: flume::Sender<Event>, event: Event) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval_at(time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if mailbox.send_async(event.clone()).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn it_posts_ticks_until_stopped() {
        let (tx, rx) = flume::unbounded();
        let mut timers = Timers::default();

        timers.start_connection(Duration::from_secs(60), tx.clone());
        timers.start_connection(Duration::from_secs(60), tx);
        time::sleep(Duration::from_secs(150)).await;
        timers.stop_connection();
        time::sleep(Duration::from_secs(120)).await;

        assert_eq!(rx.try_iter().count(), 2);
        assert!(!timers.is_connection_running());
    }

    #[tokio::test(start_paused = true)]
    async fn it_fires_the_sim_timer_once() {
        let (tx, rx) = flume::unbounded();
        let mut timers = Timers::default();

        timers.start_sim_select(Duration::from_secs(10), tx.clone());
        time::sleep(Duration::from_secs(5)).await;
        timers.start_sim_select(Duration::from_secs(10), tx);
        time::sleep(Duration::from_secs(30)).await;

        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![Event::SimTimer]);
    }
}
