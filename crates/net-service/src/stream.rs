// Copyright (C) 2026-present The rcaflow Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Lifecycle of a single peer publish stream.
//!
//! ```text
//!            Next
//!           +----+
//!           |    v
//!         +--------+  Completed (send SUCCESS)   +------------+
//!   ----->|  Open  |---------------------------->| Completing |
//!         +--------+                             +------------+
//!           |    |                                  |
//!     Error |    | Shutdown (send NODE_SHUTDOWN)    | Flushed, Error, Shutdown
//!           v    v                                  v
//!         +------------------------------------------------+
//!         |                     Closed                     |
//!         +------------------------------------------------+
//! ```
//!
//! Every event arriving in `Closed` is ignored, which makes completing an
//! already completed stream a no-op.

use crate::PublishResponseStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
pub enum StreamState {
    Open,
    /// The peer finished publishing, the final status is being written back
    Completing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum StreamEvent {
    /// The peer published a flow unit
    Next,
    /// The peer half-closed its side of the stream
    Completed,
    /// Reading from or writing to the peer failed
    Error,
    /// The node is going down, the peer is told with the given status
    Shutdown(PublishResponseStatus),
    /// All queued responses were written and the response side is closed
    Flushed,
}

/// What the owner of the stream has to do after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamAction {
    /// Hand the flow unit over to the dispatcher
    Submit,
    /// Send a terminal status and close the response channel
    Respond(PublishResponseStatus),
    /// Close the response channel without sending anything
    Close,
    Ignore,
}

impl StreamState {
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub const fn transition(self, event: StreamEvent) -> (StreamState, StreamAction) {
        match (self, event) {
            (Self::Open, StreamEvent::Next) => (Self::Open, StreamAction::Submit),
            (Self::Open, StreamEvent::Completed) => (
                Self::Completing,
                StreamAction::Respond(PublishResponseStatus::Success),
            ),
            (Self::Open, StreamEvent::Error) => (Self::Closed, StreamAction::Close),
            (Self::Open, StreamEvent::Shutdown(status)) => {
                (Self::Closed, StreamAction::Respond(status))
            }
            // The response side went away before the peer finished
            (Self::Open, StreamEvent::Flushed) => (Self::Closed, StreamAction::Close),
            (Self::Completing, StreamEvent::Next | StreamEvent::Completed) => {
                (Self::Completing, StreamAction::Ignore)
            }
            (
                Self::Completing,
                StreamEvent::Error | StreamEvent::Shutdown(_) | StreamEvent::Flushed,
            ) => (Self::Closed, StreamAction::Close),
            (Self::Closed, _) => (Self::Closed, StreamAction::Ignore),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StreamState::Open, StreamEvent::Next, StreamState::Open, StreamAction::Submit)]
    #[case(
        StreamState::Open,
        StreamEvent::Completed,
        StreamState::Completing,
        StreamAction::Respond(PublishResponseStatus::Success)
    )]
    #[case(StreamState::Open, StreamEvent::Error, StreamState::Closed, StreamAction::Close)]
    #[case(
        StreamState::Open,
        StreamEvent::Shutdown(PublishResponseStatus::NodeShutdown),
        StreamState::Closed,
        StreamAction::Respond(PublishResponseStatus::NodeShutdown)
    )]
    #[case(StreamState::Open, StreamEvent::Flushed, StreamState::Closed, StreamAction::Close)]
    #[case(
        StreamState::Completing,
        StreamEvent::Next,
        StreamState::Completing,
        StreamAction::Ignore
    )]
    #[case(
        StreamState::Completing,
        StreamEvent::Completed,
        StreamState::Completing,
        StreamAction::Ignore
    )]
    #[case(
        StreamState::Completing,
        StreamEvent::Error,
        StreamState::Closed,
        StreamAction::Close
    )]
    #[case(
        StreamState::Completing,
        StreamEvent::Shutdown(PublishResponseStatus::NodeShutdown),
        StreamState::Closed,
        StreamAction::Close
    )]
    #[case(
        StreamState::Completing,
        StreamEvent::Flushed,
        StreamState::Closed,
        StreamAction::Close
    )]
    fn test_transitions(
        #[case] state: StreamState,
        #[case] event: StreamEvent,
        #[case] expected_state: StreamState,
        #[case] expected_action: StreamAction,
    ) {
        assert_eq!(state.transition(event), (expected_state, expected_action));
    }

    #[rstest]
    fn test_closed_ignores_everything(
        #[values(
            StreamEvent::Next,
            StreamEvent::Completed,
            StreamEvent::Error,
            StreamEvent::Shutdown(PublishResponseStatus::NodeShutdown),
            StreamEvent::Flushed
        )]
        event: StreamEvent,
    ) {
        assert_eq!(
            StreamState::Closed.transition(event),
            (StreamState::Closed, StreamAction::Ignore)
        );
    }
}
