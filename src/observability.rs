use biometrics::{Collector, Counter};

pub(crate) static SCORING_REQUESTS: Counter = Counter::new("endpoint_chat.scoring.requests");
pub(crate) static SCORING_REQUEST_ERRORS: Counter =
    Counter::new("endpoint_chat.scoring.request_errors");

pub(crate) static STREAM_CHUNKS: Counter = Counter::new("endpoint_chat.stream.chunks");
pub(crate) static STREAM_ERRORS: Counter = Counter::new("endpoint_chat.stream.errors");
pub(crate) static STREAM_BYTES: Counter = Counter::new("endpoint_chat.stream.bytes");

pub(crate) static RESOLVER_LOOKUPS: Counter = Counter::new("endpoint_chat.resolver.lookups");

pub(crate) static CHAT_EXCHANGES: Counter = Counter::new("endpoint_chat.chat.exchanges");
pub(crate) static CHAT_FAILURES: Counter = Counter::new("endpoint_chat.chat.failures");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&SCORING_REQUESTS);
    collector.register_counter(&SCORING_REQUEST_ERRORS);

    collector.register_counter(&STREAM_CHUNKS);
    collector.register_counter(&STREAM_ERRORS);
    collector.register_counter(&STREAM_BYTES);

    collector.register_counter(&RESOLVER_LOOKUPS);

    collector.register_counter(&CHAT_EXCHANGES);
    collector.register_counter(&CHAT_FAILURES);
}
