//! Decode result rows into traces
//!
//! A session row's payload is every collected span document concatenated,
//! so it is read as a stream of JSON values rather than a single one.

use crate::error::StoreResult;
use crate::rows::PayloadRow;
use hjs_core::{Span, Trace, TraceId};
use serde_json::Deserializer;

/// Decode every span document in `payload`, in order
pub fn decode_spans(payload: &str) -> StoreResult<Vec<Span>> {
    Deserializer::from_str(payload)
        .into_iter::<Span>()
        .map(|span| span.map_err(Into::into))
        .collect()
}

/// One trace per row; any malformed span fails the whole batch
pub fn assemble_traces(rows: &[PayloadRow]) -> StoreResult<Vec<Trace>> {
    rows.iter()
        .map(|row| -> StoreResult<Trace> {
            let trace_id: TraceId = row.traceid.parse()?;
            Ok(Trace {
                trace_id,
                spans: decode_spans(&row.payload)?,
            })
        })
        .collect()
}

/// Merge rows of a single trace; `None` when no span was found
pub fn assemble_trace(trace_id: TraceId, rows: &[PayloadRow]) -> StoreResult<Option<Trace>> {
    let mut trace = Trace::new(trace_id);
    for row in rows {
        trace.spans.extend(decode_spans(&row.payload)?);
    }
    Ok((!trace.spans.is_empty()).then_some(trace))
}
