//! Work objects for the mpdriver executor.
//!
//! Each app implements [`mpdriver_core::Work`]. The binary that runs an
//! app also has to serve it when re-executed as a worker, which is what
//! [`serve_worker`] is for.

pub mod media;
pub mod run;

pub use media::MediaKinds;
pub use run::{PlanOptions, RunApp, RunArgs, RunInit, SourceSummary, plan};

use mpdriver_core::{Error, Result, Work, worker};

/// Serve the app registered under `name` over stdin/stdout.
pub fn serve_worker(name: &str) -> Result<()> {
    if name == RunApp::NAME {
        worker::serve::<RunApp>()
    } else {
        Err(Error::WorkerInit(format!("no app named '{}'", name)))
    }
}
