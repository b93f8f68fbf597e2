//! Trace context carried in message properties.
//!
//! The W3C `traceparent`, `tracestate` and `baggage` entries of an
//! OpenTelemetry context travel as ordinary message properties, so a
//! consumer's spans can join the trace of the producer that sent the message.
//! The global text map propagator decides what gets written; the binary
//! installs W3C trace context plus baggage with [`install_propagator`].

use std::collections::BTreeMap;

use opentelemetry::Context;
use opentelemetry::propagation::{Extractor, Injector, TextMapCompositePropagator};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};

pub const TRACEPARENT_PROPERTY: &str = "traceparent";
pub const TRACESTATE_PROPERTY: &str = "tracestate";
pub const BAGGAGE_PROPERTY: &str = "baggage";

/// Makes W3C trace context and baggage the global propagation format.
pub fn install_propagator() {
    opentelemetry::global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));
}

struct PropertyInjector<'a>(&'a mut BTreeMap<String, String>);

impl Injector for PropertyInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

struct PropertyExtractor<'a>(&'a BTreeMap<String, String>);

impl Extractor for PropertyExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Writes `cx` into `properties` with the global propagator.
pub(crate) fn inject(cx: &Context, properties: &mut BTreeMap<String, String>) {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut PropertyInjector(properties));
    });
}

/// Reads a context back out of `properties`; empty when nothing was propagated.
pub(crate) fn extract(properties: &BTreeMap<String, String>) -> Context {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&PropertyExtractor(properties))
    })
}

pub(crate) fn carries_trace(properties: &BTreeMap<String, String>) -> bool {
    properties.contains_key(TRACEPARENT_PROPERTY)
}
