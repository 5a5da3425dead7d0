use serde::Serialize;

pub fn blake3_hex(bytes: &[u8]) -> String {
    hex::encode(blake3::hash(bytes).as_bytes())
}

#[derive(Serialize)]
struct IdPayload<'a> {
    kind: &'a str,
    producer: &'a str,
    counter: u64,
    at_ms: i64,
}

/// Derives a collision-resistant id for proposals, actions and bus messages.
///
/// The digest covers a canonical CBOR encoding of (kind, producer, counter,
/// timestamp) so the same logical event always maps to the same id.
pub fn derive_id(kind: &str, producer: &str, counter: u64, at_ms: i64) -> String {
    let payload = IdPayload {
        kind,
        producer,
        counter,
        at_ms,
    };
    let bytes = serde_cbor::to_vec(&payload).unwrap_or_else(|_| {
        format!("{kind}:{producer}:{counter}:{at_ms}").into_bytes()
    });
    let digest = blake3_hex(&bytes);
    format!("{}-{}", kind, &digest[..16])
}
