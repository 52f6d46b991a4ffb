//! IO modules - external system interfaces
//!
//! - `codec` - input payload decoding, output record encoding
//! - `mqtt` - MQTT subscriber source for raw events
//! - `mqtt_egress` - MQTT publisher sink for windowed counts
//! - `jsonl` - JSONL replay source and count file sink
//! - `sink` - `CountSink` trait and the sink loop
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod codec;
pub mod jsonl;
pub mod mqtt;
pub mod mqtt_egress;
pub mod prometheus;
pub mod sink;

// Re-export commonly used types
pub use codec::{decode_event, encode_count};
pub use jsonl::{replay_file, JsonlCountSink};
pub use mqtt::start_mqtt_source;
pub use mqtt_egress::MqttCountPublisher;
pub use sink::{run_sink, CountSink};
