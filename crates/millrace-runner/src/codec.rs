use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Translation seam between the types a processor works with and the JSON
/// payloads the store persists.
///
/// The store only ever sees encoded values; callers and processors only see
/// the associated types. Where the user types are already serializable,
/// [`JsonCodec`] is the identity specialization.
pub trait Codec: Send + Sync + 'static {
    type Request: Send + Sync + 'static;
    type Response: Send + Sync + 'static;

    fn encode_request(&self, request: &Self::Request) -> Result<Value, serde_json::Error>;
    fn decode_request(&self, raw: Value) -> Result<Self::Request, serde_json::Error>;
    fn encode_response(&self, response: &Self::Response) -> Result<Value, serde_json::Error>;
    fn decode_response(&self, raw: Value) -> Result<Self::Response, serde_json::Error>;
}

/// Serde passthrough for user types that serialize directly.
pub struct JsonCodec<Req, Res> {
    _marker: PhantomData<fn() -> (Req, Res)>,
}

impl<Req, Res> JsonCodec<Req, Res> {
    pub fn new() -> Self {
        JsonCodec {
            _marker: PhantomData,
        }
    }
}

impl<Req, Res> Default for JsonCodec<Req, Res> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Res> Codec for JsonCodec<Req, Res>
where
    Req: Serialize + DeserializeOwned + Send + Sync + 'static,
    Res: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Request = Req;
    type Response = Res;

    fn encode_request(&self, request: &Req) -> Result<Value, serde_json::Error> {
        serde_json::to_value(request)
    }

    fn decode_request(&self, raw: Value) -> Result<Req, serde_json::Error> {
        serde_json::from_value(raw)
    }

    fn encode_response(&self, response: &Res) -> Result<Value, serde_json::Error> {
        serde_json::to_value(response)
    }

    fn decode_response(&self, raw: Value) -> Result<Res, serde_json::Error> {
        serde_json::from_value(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payment {
        amount: u64,
        currency: String,
    }

    #[test]
    fn json_codec_round_trips() {
        let codec: JsonCodec<Payment, String> = JsonCodec::new();
        let request = Payment {
            amount: 100,
            currency: "USD".into(),
        };
        let raw = codec.encode_request(&request).unwrap();
        assert_eq!(codec.decode_request(raw).unwrap(), request);

        let raw = codec.encode_response(&"done".to_string()).unwrap();
        assert_eq!(codec.decode_response(raw).unwrap(), "done");
    }
}
