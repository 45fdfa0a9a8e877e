//! Periodic read-only view of the shared region.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use treeview::{Active, Shape, CLEAR_HOME};

use crate::region::SharedRegion;
use crate::shutdown::Shutdown;

pub struct Renderer {
    region: Arc<SharedRegion>,
    shape: Shape,
    interval: Duration,
    color: bool,
    out: Box<dyn Write + Send>,
}

impl Renderer {
    /// Draw to stdout every 100 ms.
    pub fn new(region: Arc<SharedRegion>, shape: Shape) -> Self {
        Self {
            region,
            shape,
            interval: Duration::from_millis(100),
            color: true,
            out: Box::new(io::stdout()),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Draw plain frames (no escape codes) to `out`.
    pub fn plain(mut self, out: Box<dyn Write + Send>) -> Self {
        self.color = false;
        self.out = out;
        self
    }

    /// One frame of the current state.
    pub fn frame(&self) -> String {
        let active = self
            .region
            .active()
            .map(|slot| Active { node: slot.process, thread: slot.thread });
        treeview::render(&self.shape, active, self.color)
    }

    /// Redraw until the region stops or shutdown is requested. Returns the
    /// number of frames drawn.
    pub fn run(mut self, shutdown: &Shutdown) -> usize {
        let mut frames = 0;
        while self.region.is_running() && !shutdown.is_triggered() {
            let mut text = self.frame();
            if self.color {
                text.insert_str(0, CLEAR_HOME);
            }
            if let Err(err) = self.out.write_all(text.as_bytes()).and_then(|()| self.out.flush()) {
                warn!("renderer: {}; stopping display", err);
                break;
            }
            frames += 1;
            self.region.sleep(self.interval);
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::ActiveSlot;
    use gatesched_kernel::task::{Pid, Tid};

    #[test]
    fn frame_reflects_active_slot() {
        let region = Arc::new(SharedRegion::new(8).unwrap());
        let shape = Shape { depth: 3, fanout: 2, threads: 3 };
        let renderer = Renderer::new(region.clone(), shape).plain(Box::new(io::sink()));
        assert!(renderer.frame().contains("Active: -"));
        region.record(ActiveSlot { process: 6, thread: 2 }, Pid(1), Tid(1));
        assert!(renderer.frame().contains("Active: P:6 T:2"));
    }

    #[test]
    fn run_stops_with_the_region() {
        let region = Arc::new(SharedRegion::new(8).unwrap());
        let shape = Shape { depth: 1, fanout: 2, threads: 1 };
        let shutdown = Shutdown::new();
        let renderer = Renderer::new(region.clone(), shape)
            .interval(Duration::from_millis(1))
            .plain(Box::new(io::sink()));
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            region.stop();
        });
        assert!(renderer.run(&shutdown) >= 1);
        stopper.join().unwrap();
    }
}
