//! Single-process rendering.
//!
//! Used when no worker pool exists. Operations are applied and rendered
//! on the calling thread instead of on a coordinator tick; ordering and
//! position rules are the same.

use std::time::Instant;

use parking_lot::Mutex;

use super::board::Board;
use super::handle::Transport;
use super::screen::Screen;
use super::types::{BarId, BarValue, ProgressOp, ProgressResponse, RequesterId};
use crate::config::ProgressConfig;
use crate::error::Result;

pub struct LocalTransport {
    state: Mutex<LocalState>,
}

struct LocalState {
    board: Board,
    next_bar: u64,
}

impl LocalTransport {
    pub fn new(config: &ProgressConfig) -> Self {
        Self {
            state: Mutex::new(LocalState {
                board: Board::new(Screen::new(&config.target, config.width)),
                next_bar: 0,
            }),
        }
    }
}

impl LocalState {
    fn handle(&mut self, bar: Option<BarId>, op: ProgressOp) -> ProgressResponse {
        let response = match op {
            ProgressOp::Create(options) => {
                self.next_bar += 1;
                let id = BarId(self.next_bar);
                self.board.create(id, options, Instant::now());
                ProgressResponse::Created(id)
            }
            ProgressOp::Write(line) => {
                return match self.board.write_line(&line) {
                    Ok(()) => ProgressResponse::Ack,
                    Err(e) => ProgressResponse::Rejected(format!("write failed: {}", e)),
                };
            }
            ProgressOp::Exit => return ProgressResponse::Ack,
            op => {
                let Some(id) = bar else {
                    return ProgressResponse::Rejected(format!("'{}' needs a bar id", op.name()));
                };
                if !self.board.contains(id) {
                    if let ProgressOp::Close = op {
                        return ProgressResponse::Ack;
                    }
                    return ProgressResponse::UnknownBar(id);
                }
                match op {
                    ProgressOp::GetAttr(attr) => match self.board.get(id, attr) {
                        Some(value) => return ProgressResponse::Value(value),
                        None => return ProgressResponse::UnknownBar(id),
                    },
                    ProgressOp::SetAttr(BarValue::Position(_)) => {
                        return ProgressResponse::Rejected(
                            "position is assigned by the ordering pass".into(),
                        );
                    }
                    op => match self.board.apply(id, op) {
                        Ok(()) => ProgressResponse::Ack,
                        Err(message) => return ProgressResponse::Rejected(message),
                    },
                }
            }
        };

        self.board.redraw(false);
        response
    }
}

impl Transport for LocalTransport {
    fn requester(&self) -> RequesterId {
        RequesterId(1)
    }

    fn call(&self, bar: Option<BarId>, op: ProgressOp) -> Result<ProgressResponse> {
        Ok(self.state.lock().handle(bar, op))
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.state.get_mut().board.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::handle::ProgressHandle;
    use crate::progress::screen::{RenderTarget, SharedBuffer};
    use crate::progress::types::BarOptions;

    fn local(buffer: &SharedBuffer) -> ProgressHandle {
        ProgressHandle::local(&ProgressConfig {
            target: RenderTarget::Buffer(buffer.clone()),
            ..ProgressConfig::default()
        })
    }

    #[test]
    fn test_positions_apply_immediately() {
        let handle = local(&SharedBuffer::new());

        let low = handle.bar(BarOptions::new("low").priority(5.0)).unwrap();
        let high = handle.bar(BarOptions::new("high").priority(0.0)).unwrap();

        assert_eq!(high.position().unwrap(), Some(0));
        assert_eq!(low.position().unwrap(), Some(1));

        high.close().unwrap();
        assert_eq!(low.position().unwrap(), Some(0));
    }

    #[test]
    fn test_updates_are_visible_at_once() {
        let handle = local(&SharedBuffer::new());
        let bar = handle.bar(BarOptions::new("n").total(3)).unwrap();
        bar.update(2).unwrap();
        assert_eq!(bar.count().unwrap(), 2);
    }

    #[test]
    fn test_leave_prints_final_line() {
        let buffer = SharedBuffer::new();
        let handle = local(&buffer);

        let kept = handle.bar(BarOptions::new("kept").total(1).leave(true)).unwrap();
        kept.update(1).unwrap();
        kept.close().unwrap();

        assert!(buffer.contents().contains("kept: 100%|"));
        assert!(buffer.contents().contains("| 1/1 ["));
    }

    #[test]
    fn test_unknown_bar_after_close() {
        let handle = local(&SharedBuffer::new());
        let bar = handle.bar(BarOptions::default()).unwrap();
        bar.close().unwrap();
        assert!(bar.update(1).is_err());
    }
}
