//! Caller-side progress handles.
//!
//! A [`ProgressHandle`] forwards every operation through a [`Transport`]
//! and blocks for the reply. Host handles talk to an in-process
//! coordinator over channels, client handles talk to the parent over the
//! worker's IPC pipe, local handles render directly. All three behave the
//! same to the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::coordinator::HostTransport;
use super::local::LocalTransport;
use super::types::{
    BarAttr, BarId, BarOptions, BarValue, Colour, ProgressOp, ProgressResponse, RequesterId,
};
use crate::config::ProgressConfig;
use crate::error::{Error, Result};

/// A request/response link to whatever owns the bars.
pub trait Transport: Send + Sync {
    /// Id this transport's replies are routed by.
    fn requester(&self) -> RequesterId;

    /// Send one operation and block until it is answered.
    fn call(&self, bar: Option<BarId>, op: ProgressOp) -> Result<ProgressResponse>;
}

/// Factory for bars, proxies and console lines.
#[derive(Clone)]
pub struct ProgressHandle {
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for ProgressHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHandle")
            .field("requester", &self.transport.requester())
            .finish()
    }
}

impl ProgressHandle {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Handle bound to a coordinator in this process.
    pub fn host(transport: Arc<HostTransport>) -> Self {
        Self::new(transport)
    }

    /// Handle that renders in-process without a coordinator.
    pub fn local(config: &ProgressConfig) -> Self {
        Self::new(Arc::new(LocalTransport::new(config)))
    }

    pub fn requester(&self) -> RequesterId {
        self.transport.requester()
    }

    /// Create a bar.
    pub fn bar(&self, options: BarOptions) -> Result<BarHandle> {
        match self.transport.call(None, ProgressOp::Create(options))? {
            ProgressResponse::Created(id) => Ok(BarHandle {
                id,
                transport: Arc::clone(&self.transport),
                closed: AtomicBool::new(false),
            }),
            other => Err(unexpected("create", other)),
        }
    }

    /// Wrap an iterator so each pulled element advances a new bar by one.
    ///
    /// The total comes from the iterator's exact size hint unless the
    /// options already carry one.
    pub fn wrap<I>(&self, iter: I, mut options: BarOptions) -> Result<Proxy<I::IntoIter>>
    where
        I: IntoIterator,
    {
        let inner = iter.into_iter();
        if options.total.is_none()
            && let (lower, Some(upper)) = inner.size_hint()
            && lower == upper
        {
            options.total = Some(lower as u64);
        }
        Ok(Proxy {
            inner,
            bar: self.bar(options)?,
            error: None,
        })
    }

    /// Print a line above the bars without tearing them.
    pub fn write(&self, line: impl Into<String>) -> Result<()> {
        match self.transport.call(None, ProgressOp::Write(line.into()))? {
            ProgressResponse::Ack => Ok(()),
            other => Err(unexpected("write", other)),
        }
    }
}

/// One remote bar. Dropping it closes the bar.
pub struct BarHandle {
    id: BarId,
    transport: Arc<dyn Transport>,
    closed: AtomicBool,
}

impl std::fmt::Debug for BarHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl BarHandle {
    pub fn id(&self) -> BarId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn update(&self, delta: u64) -> Result<()> {
        self.ack(ProgressOp::Update { delta })
    }

    /// Close the bar. Only the first call reaches the coordinator.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.ack(ProgressOp::Close)
    }

    pub fn reset(&self, total: Option<u64>) -> Result<()> {
        self.ack(ProgressOp::Reset { total })
    }

    pub fn set_description(&self, description: impl Into<String>) -> Result<()> {
        self.ack(ProgressOp::SetDescription(description.into()))
    }

    pub fn set_colour(&self, colour: Option<Colour>) -> Result<()> {
        self.ack(ProgressOp::SetColour(colour))
    }

    pub fn set_priority(&self, priority: f64) -> Result<()> {
        self.set(BarValue::Priority(priority))
    }

    pub fn get(&self, attr: BarAttr) -> Result<BarValue> {
        match self.transport.call(Some(self.id), ProgressOp::GetAttr(attr))? {
            ProgressResponse::Value(value) => Ok(value),
            other => Err(unexpected("get_attr", other)),
        }
    }

    pub fn set(&self, value: BarValue) -> Result<()> {
        self.ack(ProgressOp::SetAttr(value))
    }

    /// Counter as of the coordinator's last render pass.
    pub fn count(&self) -> Result<u64> {
        match self.get(BarAttr::Count)? {
            BarValue::Count(n) => Ok(n),
            other => Err(Error::Progress(format!("expected a count, got {:?}", other))),
        }
    }

    /// Screen row as of the last ordering pass.
    pub fn position(&self) -> Result<Option<usize>> {
        match self.get(BarAttr::Position)? {
            BarValue::Position(p) => Ok(p.map(|p| p as usize)),
            other => Err(Error::Progress(format!("expected a position, got {:?}", other))),
        }
    }

    fn ack(&self, op: ProgressOp) -> Result<()> {
        let name = op.name();
        match self.transport.call(Some(self.id), op)? {
            ProgressResponse::Ack => Ok(()),
            other => Err(unexpected(name, other)),
        }
    }
}

impl Drop for BarHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::debug!("Closing {} on drop failed: {}", self.id, e);
        }
    }
}

/// Iterator adapter that advances its bar by one per element.
///
/// Progress failures stop iteration; the first one is kept and returned
/// by [`Proxy::close`] or [`Proxy::take_error`].
pub struct Proxy<I> {
    inner: I,
    bar: BarHandle,
    error: Option<Error>,
}

impl<I> Proxy<I> {
    pub fn bar(&self) -> &BarHandle {
        &self.bar
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    /// Close the bar, reporting any failure seen while iterating first.
    pub fn close(mut self) -> Result<()> {
        let closed = self.bar.close();
        match self.error.take() {
            Some(e) => Err(e),
            None => closed,
        }
    }
}

impl<I: Iterator> Iterator for Proxy<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if self.error.is_some() {
            return None;
        }
        let item = self.inner.next()?;
        if let Err(e) = self.bar.update(1) {
            self.error = Some(e);
            return None;
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.error.is_some() {
            (0, Some(0))
        } else {
            self.inner.size_hint()
        }
    }
}

fn unexpected(op: &str, response: ProgressResponse) -> Error {
    match response {
        ProgressResponse::UnknownBar(id) => Error::Progress(format!("{} is not a live bar", id)),
        ProgressResponse::Rejected(message) => {
            Error::InvalidOperation(format!("{} rejected: {}", op, message))
        }
        other => Error::Progress(format!("unexpected reply to {}: {:?}", op, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::coordinator::Coordinator;
    use crate::progress::screen::RenderTarget;
    use std::time::Duration;

    fn coordinator() -> Coordinator {
        Coordinator::spawn(&ProgressConfig {
            render_interval: Duration::from_millis(10),
            target: RenderTarget::Hidden,
            ..ProgressConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_proxy_request_counts() {
        let coordinator = coordinator();
        let handle = coordinator.handle();

        let mut proxy = handle.wrap(0..1000u64, BarOptions::new("items")).unwrap();
        let sum: u64 = (&mut proxy).sum();
        proxy.close().unwrap();
        assert_eq!(sum, 499_500);

        let stats = coordinator.stats();
        assert_eq!(stats.count("create"), 1);
        assert_eq!(stats.count("update"), 1000);
        assert_eq!(stats.count("close"), 1);
    }

    #[test]
    fn test_double_close_sends_one_request() {
        let coordinator = coordinator();
        let handle = coordinator.handle();

        let bar = handle.bar(BarOptions::new("once")).unwrap();
        bar.close().unwrap();
        bar.close().unwrap();
        drop(bar);

        assert_eq!(coordinator.stats().count("close"), 1);
    }

    #[test]
    fn test_wrap_infers_total() {
        let coordinator = coordinator();
        let handle = coordinator.handle();

        let proxy = handle.wrap(vec!['a', 'b', 'c'], BarOptions::new("chars")).unwrap();
        assert_eq!(
            proxy.bar().get(BarAttr::Total).unwrap(),
            BarValue::Total(Some(3))
        );

        let filtered = handle
            .wrap((0..10).filter(|n| n % 2 == 0), BarOptions::new("evens"))
            .unwrap();
        assert_eq!(
            filtered.bar().get(BarAttr::Total).unwrap(),
            BarValue::Total(None)
        );
    }

    #[test]
    fn test_rejected_position_is_an_error() {
        let coordinator = coordinator();
        let bar = coordinator.handle().bar(BarOptions::default()).unwrap();
        let err = bar.set(BarValue::Position(Some(1))).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)), "{err}");
    }

    #[test]
    fn test_proxy_stops_when_coordinator_is_gone() {
        let mut coordinator = coordinator();
        let handle = coordinator.handle();
        let mut proxy = handle.wrap(0..10, BarOptions::new("cut")).unwrap();
        assert_eq!(proxy.next(), Some(0));

        coordinator.shutdown();
        assert_eq!(proxy.next(), None);
        let err = proxy.close().unwrap_err();
        assert!(err.is_coordination_lost(), "{err}");
    }
}
