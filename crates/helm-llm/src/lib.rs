pub mod accumulator;
pub mod anthropic;
pub mod mock;
pub mod openai;
pub mod reliable;
pub mod sse;

pub use accumulator::{AccumulatedCall, AccumulatorError, ToolCallAccumulator, ToolCallState};
pub use anthropic::AnthropicProvider;
pub use mock::{MockProvider, MockResponse};
pub use openai::OpenAiCompatProvider;
pub use reliable::{ReliableConfig, ReliableProvider};
