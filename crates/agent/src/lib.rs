//! The JARVIS assistant core.
//!
//! A chat turn flows through:
//!
//! 1. **Route** the message to a ready model tier ([`router`])
//! 2. **Recall** memory and store facts the user stated ([`facts`])
//! 3. **Assemble** persona, memory, history and the message under a token
//!    budget ([`context`])
//! 4. **Generate** on the tier's model session, streaming tokens and
//!    thoughts to the caller ([`stream`])
//!
//! [`Assistant`] ties the steps together.

pub mod assistant;
pub mod context;
pub mod facts;
pub mod router;
pub mod stream;

pub use assistant::{Assistant, ChatResponse, ModelStatus};
pub use context::{AssembledContext, AssemblyInput, AssemblyMetadata, ContextAssembler};
pub use router::{Complexity, Intent, RouteDecision, TierRouter, detect_intents};
pub use stream::{ChatEvent, ChatStream};
