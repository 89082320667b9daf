//! Board output: the visible page of the fleet, rotated on a timer and
//! re-rendered whenever the session publishes a change.

use std::time::Duration;

use lib_fleet::telemetry::model::format_hhmm;
use lib_fleet::telemetry::{Fleet, MachineRecord};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Page rotation over a fleet of changing size.
///
/// With `n` machines the last page index is `n / page_size - 1` in real
/// division. Once that bound is not positive the fleet fits one page and
/// rotation stops for the rest of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct Pager {
    page_size: usize,
    page: usize,
    stopped: bool,
}

impl Pager {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            page: 0,
            stopped: false,
        }
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Advances one step for a fleet of `machines`. Returns the new page, or
    /// `None` once rotation has stopped.
    pub fn tick(&mut self, machines: usize) -> Option<usize> {
        if self.stopped {
            return None;
        }
        let max = machines as f64 / self.page_size as f64 - 1.0;
        if max <= 0.0 {
            self.stopped = true;
            self.page = 0;
            return None;
        }
        if (self.page as f64) < max {
            self.page += 1;
        } else {
            self.page = 0;
        }
        Some(self.page)
    }
}

/// One board line.
pub fn render_row(record: &MachineRecord) -> String {
    let pair = record.presentation();
    let progress = record
        .progress_percent()
        .map(|p| format!("{}%", p))
        .unwrap_or_else(|| "-".to_string());
    let done = record
        .effective_completion_time()
        .map(|t| t.format("%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:>4} {:<12} {:<8} {} {:<10} {}/{} ({}{}) cycle {} done {}",
        record.display_number,
        record.name,
        pair.label,
        pair.color.as_hex(),
        record.program_name,
        record.produced_count,
        record.planned_count,
        progress,
        if record.plan_met() { ", met" } else { "" },
        format_hhmm(record.cycle_time()),
        done
    )
}

pub fn render_page(fleet: &Fleet, pager: &Pager) -> Vec<String> {
    fleet
        .page(pager.page(), pager.page_size())
        .iter()
        .map(|record| render_row(record))
        .collect()
}

fn log_board(fleet: &Fleet, pager: &Pager) {
    log::info!(
        "Board page {} | active {}/{}",
        pager.page() + 1,
        fleet.active_count(),
        fleet.len()
    );
    for line in render_page(fleet, pager) {
        log::debug!("{}", line);
    }
}

/// Renders on every published change and rotates pages until the fleet fits
/// one page or `shutdown` fires.
pub async fn run(mut fleet_rx: watch::Receiver<Fleet>, page_size: usize, interval: Duration, shutdown: CancellationToken) {
    let mut pager = Pager::new(page_size);
    let mut rotation = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = fleet_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let fleet = fleet_rx.borrow_and_update().clone();
                log_board(&fleet, &pager);
            }
            _ = rotation.tick(), if !pager.is_stopped() => {
                let fleet = fleet_rx.borrow().clone();
                if pager.tick(fleet.len()).is_some() {
                    log_board(&fleet, &pager);
                } else {
                    log::debug!("Fleet fits one page; page rotation stopped.");
                }
            }
        }
    }
    log::info!("Board stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_fleet::telemetry::{ExecutionState, OperatingMode};

    fn fleet_of(n: usize) -> Fleet {
        Fleet::from_records(
            (1..=n)
                .map(|i| MachineRecord::new(i.to_string(), i.to_string()))
                .collect(),
        )
    }

    #[test]
    fn rotation_wraps_after_last_page() {
        let mut pager = Pager::new(13);
        assert_eq!(pager.tick(26), Some(1));
        assert_eq!(pager.tick(26), Some(0));
        assert_eq!(pager.tick(27), Some(1));
        assert_eq!(pager.tick(27), Some(2));
        assert_eq!(pager.tick(27), Some(0));
    }

    #[test]
    fn partial_second_page_is_shown() {
        let mut pager = Pager::new(13);
        assert_eq!(pager.tick(20), Some(1));
        assert_eq!(render_page(&fleet_of(20), &pager).len(), 7);
        assert_eq!(pager.tick(20), Some(0));
    }

    #[test]
    fn rotation_stops_for_good_on_single_page() {
        let mut pager = Pager::new(13);
        assert_eq!(pager.tick(13), None);
        assert!(pager.is_stopped());
        assert_eq!(pager.tick(40), None);
        assert_eq!(pager.page(), 0);
    }

    #[test]
    fn row_shows_label_color_and_progress() {
        let mut record = MachineRecord::new("4", "12");
        record.name = "LATHE".to_string();
        record.execution_state = ExecutionState::Running;
        record.operating_mode = OperatingMode::Automatic;
        record.produced_count = 10;
        record.planned_count = 10;
        record.cycle_remaining = Duration::from_secs(90 * 60);

        let line = render_row(&record);
        assert!(line.contains("AUTO"));
        assert!(line.contains("#43a047"));
        assert!(line.contains("10/10 (100%, met)"));
        assert!(line.contains("cycle 01:30"));
        assert!(line.ends_with("done -"));
    }

    #[tokio::test(start_paused = true)]
    async fn board_stops_on_shutdown() {
        let (tx, rx) = watch::channel(fleet_of(30));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(rx, 13, Duration::from_secs(10), shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send_replace(fleet_of(5));
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
