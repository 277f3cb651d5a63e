use crate::extractor::RequestKind;
use serde::{Deserialize, Serialize};

/// Represents the current state of the user dialogue
#[derive(Clone, Serialize, Deserialize, Default)]
pub enum State {
    /// Nothing pending; links are answered with a kind-picker
    #[default]
    Start,
    /// A kind was picked, the next link is downloaded as that kind
    AwaitingTarget(RequestKind),
    /// Link info was picked, the next link is probed instead of downloaded
    AwaitingInfoTarget,
    /// Song search was picked, the next text is the query
    AwaitingSearchQuery,
}
