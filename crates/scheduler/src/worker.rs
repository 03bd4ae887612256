use std::{
	future::Future,
	panic::{panic_any, AssertUnwindSafe},
	time::Duration,
};

use async_channel as chan;
use futures::FutureExt;
use tokio::{spawn, task::JoinHandle, time::timeout};
use tracing::{error, warn};

/// Stop signal handed to a background loop.
pub(crate) struct Stopper(chan::Receiver<()>);

impl Stopper {
	/// The signal as a stream, to be merged with the loop's own message stream.
	pub(crate) fn into_stream(self) -> chan::Receiver<()> {
		self.0
	}
}

/// Handle of a spawned background loop.
pub(crate) struct LoopHandle {
	name: &'static str,
	stop_tx: chan::Sender<()>,
	handle: Option<JoinHandle<()>>,
}

impl LoopHandle {
	/// Spawns `run` with its own stop signal. A panic inside the loop is logged and ends it.
	pub(crate) fn spawn<F, Fut>(name: &'static str, run: F) -> Self
	where
		F: FnOnce(Stopper) -> Fut,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let (stop_tx, stop_rx) = chan::bounded(1);
		let fut = run(Stopper(stop_rx));

		let handle = spawn(async move {
			if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
				error!(name, "Scheduler loop unexpectedly panicked");
			}
		});

		Self {
			name,
			stop_tx,
			handle: Some(handle),
		}
	}

	pub(crate) async fn stop(&mut self, grace_period: Duration) {
		if self.stop_tx.send(()).await.is_err() {
			warn!(name = self.name, "Loop no longer listens for its stop signal");
		}

		wait_stop_or_abort(self.name, self.handle.take(), grace_period).await;
	}
}

impl Drop for LoopHandle {
	fn drop(&mut self) {
		// Never stopped, e.g. the scheduler was dropped without a shutdown.
		if let Some(handle) = self.handle.take() {
			handle.abort();
		}
	}
}

async fn wait_stop_or_abort(
	name: &'static str,
	maybe_handle: Option<JoinHandle<()>>,
	grace_period: Duration,
) {
	if let Some(handle) = maybe_handle {
		let abort_handle = handle.abort_handle();

		match timeout(grace_period, handle).await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => {
				// Panics inside the loop are caught by `catch_unwind` already.
				if e.is_panic() {
					error!(name, "Scheduler loop panic escaped, resuming it");
					panic_any(e.into_panic());
				}
			}
			Err(_) => {
				error!(name, ?grace_period, "Scheduler loop did not stop in time, aborting it");
				abort_handle.abort();
			}
		}
	}
}
