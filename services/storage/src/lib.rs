//! Media Storage Service
//!
//! Streaming upload and retrieval service for images and other blobs. Uploads
//! arrive as `multipart/form-data` and are written part by part straight into
//! a flat blob directory without buffering whole parts in memory. Images can
//! be fetched at a requested width; each such derivative is decoded upright
//! from its EXIF orientation, resized, encoded as JPEG and kept on disk for
//! later requests.
//!
//! ## Architecture
//!
//! ```text
//!  POST /upload                               GET /get?path&size
//! ┌──────────────┐                           ┌──────────────┐
//! │ Multipart    │                           │ Derivative   │
//! │ Decoder      │                           │ Cache        │
//! └──────────────┘                           └──────────────┘
//!    │        │                                 │        │
//!    ▼        ▼                                 │        ▼
//! ┌──────┐ ┌──────────┐                         │  ┌──────────────┐
//! │ Line │ │ Rotating │                         │  │ Image        │
//! │Reader│ │ Window   │                         │  │ Normalizer   │
//! └──────┘ └──────────┘                         │  └──────────────┘
//!    │                                          │        │
//!    ▼                                          ▼        ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ Store: <root>/<name>, <root>/<name>-<width>, per-key locks│
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod derivative;
pub mod header;
pub mod image_normalizer;
pub mod line_reader;
pub mod multipart;
pub mod orientation;
pub mod rotating_window;
pub mod store;

pub use api::{create_router, start_api_server, AppState, ErrorResponse};
pub use config::Config;
pub use derivative::{DerivativeCache, DerivativeError, DerivativeSettings, DerivativeStats};
pub use multipart::{DecodeOutcome, DecoderSettings, MultipartDecoder, UploadError};
pub use store::{Store, StoreError};
