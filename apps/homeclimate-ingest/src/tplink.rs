mod cipher;
mod client;

pub use cipher::{decode_frame, decrypt, encode_frame, encrypt, INITIAL_KEY};
pub use client::{
    decode_response, parse_realtime, EmeterReading, ProtocolError, TpLinkClient, DEFAULT_PORT,
    REALTIME_QUERY,
};
