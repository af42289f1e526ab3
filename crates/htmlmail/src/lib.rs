//! Compose self-contained HTML email.
//!
//! Linked stylesheets are inlined, local images are embedded and referenced by
//! content identifier, and attachments given as paths, uploads, data URLs or remote
//! references are normalized before the message is handed to a transport.
//!
//! Refer to:
//! - [RFC 2557](https://datatracker.ietf.org/doc/html/rfc2557)
//! - [RFC 2397](https://datatracker.ietf.org/doc/html/rfc2397)

pub use htmlmail_common::{
    ConfigError, SenderConfig, SenderOverrides, SmtpEncryption, SmtpSettings,
};

pub use crate::{
    attachment::{
        AttachmentInput, AttachmentItem, AttachmentOrigin, AttachmentResolver, Fetcher,
        HttpFetcher, ResolveReport, UploadedFiles,
    },
    composer::{ComposedMail, MailComposer, Mailer, RecipientEntry, SendReport},
    error::MailError,
    message::{OutboundMessage, Recipient},
    rewrite::{BodyRewriter, EmbeddedResource, ResourceSink, RewriteReport},
    stylesheet::StylesheetInliner,
    transport::{RecordingTransport, SmtpMailer, Transport},
};

pub mod attachment;
pub mod composer;
mod error;
pub mod message;
pub mod rewrite;
pub mod stylesheet;
pub mod text;
pub mod transport;
mod utils;
