//! Message composition: collect fields, rewrite the body, resolve attachments, send.
//!
//! [`MailComposer`] accumulates fields. [`MailComposer::compose`] consumes it and
//! produces a [`ComposedMail`], which can only be sent. Sending consumes the composed
//! mail and yields a [`SendReport`].

use std::{collections::HashSet, path::PathBuf};

use htmlmail_common::{SenderConfig, SenderOverrides, SmtpSettings};
use lettre::message::Mailbox;
use tracing::{debug, error, info};

use crate::{
    attachment::{AttachmentInput, AttachmentResolver},
    error::MailError,
    message::{OutboundMessage, Recipient},
    rewrite::{BodyRewriter, EmbeddedResource, ResourceSink},
    text::html_to_plain,
    transport::{SmtpMailer, Transport},
};

/// Embedded resources of one message, unique by content identifier.
#[derive(Debug, Default)]
struct EmbeddedResources {
    ids: HashSet<String>,
    resources: Vec<EmbeddedResource>,
}

impl ResourceSink for EmbeddedResources {
    fn register(&mut self, resource: EmbeddedResource) {
        if self.ids.insert(resource.content_id().to_string()) {
            self.resources.push(resource);
        }
    }
}

/// Message under construction.
#[derive(Clone, Debug)]
pub struct MailComposer {
    from: Mailbox,
    rewriter: BodyRewriter,
    resolver: AttachmentResolver,
    to: Vec<Recipient>,
    cc: Vec<Recipient>,
    bcc: Vec<Recipient>,
    reply_to: Option<Recipient>,
    subject: String,
    body: String,
    alt_body: Option<String>,
    attachments: Vec<AttachmentInput>,
}

impl MailComposer {
    /// Create new [`MailComposer`] sending as `sender`.
    #[must_use]
    pub fn new(sender: &SenderConfig) -> Self {
        Self {
            from: Mailbox::new(Some(sender.name().to_string()), sender.address().clone()),
            rewriter: BodyRewriter::default(),
            resolver: AttachmentResolver::default(),
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: None,
            subject: String::new(),
            body: String::new(),
            alt_body: None,
            attachments: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_rewriter(mut self, rewriter: BodyRewriter) -> Self {
        self.rewriter = rewriter;
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: AttachmentResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn add_recipient(&mut self, recipient: Recipient) -> &mut Self {
        self.to.push(recipient);
        self
    }

    pub fn add_cc(&mut self, recipient: Recipient) -> &mut Self {
        self.cc.push(recipient);
        self
    }

    pub fn add_bcc(&mut self, recipient: Recipient) -> &mut Self {
        self.bcc.push(recipient);
        self
    }

    pub fn set_reply_to(&mut self, recipient: Recipient) -> &mut Self {
        self.reply_to = Some(recipient);
        self
    }

    pub fn set_subject<S>(&mut self, subject: S) -> &mut Self
    where
        S: Into<String>,
    {
        self.subject = subject.into();
        self
    }

    /// HTML body; rewritten at compose time.
    pub fn set_body<S>(&mut self, body: S) -> &mut Self
    where
        S: Into<String>,
    {
        self.body = body.into();
        self
    }

    /// Plain-text alternative. Derived from the HTML body when not set.
    pub fn set_alt_body<S>(&mut self, alt_body: S) -> &mut Self
    where
        S: Into<String>,
    {
        self.alt_body = Some(alt_body.into());
        self
    }

    pub fn add_attachment(&mut self, input: AttachmentInput) -> &mut Self {
        self.attachments.push(input);
        self
    }

    pub fn add_attachments<I>(&mut self, inputs: I) -> &mut Self
    where
        I: IntoIterator<Item = AttachmentInput>,
    {
        self.attachments.extend(inputs);
        self
    }

    /// Rewrite the body and resolve attachments.
    pub fn compose(self) -> Result<ComposedMail, MailError> {
        if self.to.is_empty() {
            return Err(MailError::NoRecipients);
        }

        let mut embedded = EmbeddedResources::default();
        let (html, rewrite_report) = self.rewriter.rewrite_with_report(&self.body, &mut embedded);
        let resolved = self.resolver.resolve_all(self.attachments);
        let plain = self.alt_body.unwrap_or_else(|| html_to_plain(&html));

        debug!(
            "Composed mail with {} embedded resource(s) and {} attachment(s)",
            embedded.resources.len(),
            resolved.items.len()
        );
        Ok(ComposedMail {
            message: OutboundMessage {
                from: self.from,
                to: self.to,
                cc: self.cc,
                bcc: self.bcc,
                reply_to: self.reply_to,
                subject: self.subject,
                html,
                plain,
                embedded: embedded.resources,
                attachments: resolved.items,
            },
            skipped_resources: rewrite_report.skipped,
            skipped_attachments: resolved.skipped,
        })
    }

    /// Compose and send, reporting the outcome in detail.
    pub fn try_send<T>(self, transport: T) -> Result<SendReport, MailError>
    where
        T: Transport,
    {
        self.compose()?.send(transport)
    }

    /// Compose and send; any failure yields `false`.
    pub fn send<T>(self, transport: T) -> bool
    where
        T: Transport,
    {
        match self.compose() {
            Ok(composed) => composed.send_compat(transport),
            Err(err) => {
                error!("Failed to compose mail: {err}");
                false
            }
        }
    }
}

/// Message ready to be handed to a transport.
#[derive(Clone, Debug)]
pub struct ComposedMail {
    message: OutboundMessage,
    skipped_resources: usize,
    skipped_attachments: usize,
}

impl ComposedMail {
    /// Getter for `message`.
    #[must_use]
    pub fn message(&self) -> &OutboundMessage {
        &self.message
    }

    /// Local references in the body that could not be embedded or inlined.
    #[must_use]
    pub fn skipped_resources(&self) -> usize {
        self.skipped_resources
    }

    /// Attachment inputs that were dropped.
    #[must_use]
    pub fn skipped_attachments(&self) -> usize {
        self.skipped_attachments
    }

    /// Sends the message through `transport`.
    pub fn send<T>(self, transport: T) -> Result<SendReport, MailError>
    where
        T: Transport,
    {
        let (to, subject) = (self.message.recipients(), self.message.subject.clone());
        debug!("Sending mail to: {to}, subject: {subject}");

        match transport.deliver(&self.message) {
            Ok(()) => {
                info!("Mail sent to: {to}, subject: {subject}");
                Ok(SendReport {
                    recipients: self
                        .message
                        .to
                        .into_iter()
                        .map(|recipient| recipient.address)
                        .collect(),
                    subject,
                    embedded: self.message.embedded.len(),
                    attachments: self.message.attachments.len(),
                    skipped_resources: self.skipped_resources,
                    skipped_attachments: self.skipped_attachments,
                })
            }
            Err(err) => {
                error!("Failed to send mail to: {to}, subject: {subject}, error: {err}");
                Err(err)
            }
        }
    }

    /// Same as [`ComposedMail::send`], collapsing the outcome to a flag.
    pub fn send_compat<T>(self, transport: T) -> bool
    where
        T: Transport,
    {
        self.send(transport).is_ok()
    }
}

/// Outcome of a successful send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendReport {
    pub recipients: Vec<String>,
    pub subject: String,
    pub embedded: usize,
    pub attachments: usize,
    pub skipped_resources: usize,
    pub skipped_attachments: usize,
}

/// One message of a batch send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecipientEntry {
    pub name: Option<String>,
    pub address: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<AttachmentInput>,
}

impl RecipientEntry {
    #[must_use]
    pub fn new<A, S, B>(address: A, subject: S, body: B) -> Self
    where
        A: Into<String>,
        S: Into<String>,
        B: Into<String>,
    {
        Self {
            name: None,
            address: address.into(),
            subject: subject.into(),
            body: body.into(),
            attachments: Vec::new(),
        }
    }

    #[must_use]
    pub fn named<N>(mut self, name: N) -> Self
    where
        N: Into<String>,
    {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_attachments<I>(mut self, attachments: I) -> Self
    where
        I: IntoIterator<Item = AttachmentInput>,
    {
        self.attachments.extend(attachments);
        self
    }

    fn recipient(&self) -> Recipient {
        match &self.name {
            Some(name) => Recipient::named(name.as_str(), self.address.as_str()),
            None => Recipient::new(self.address.as_str()),
        }
    }
}

/// Sender identity, rewrite settings and transport shared by many sends.
#[derive(Debug)]
pub struct Mailer<T> {
    sender: SenderConfig,
    rewriter: BodyRewriter,
    resolver: AttachmentResolver,
    transport: T,
}

impl Mailer<SmtpMailer> {
    /// Mailer configured from `MAIL_*` and `SMTP_*` environment variables.
    pub fn from_env(overrides: SenderOverrides) -> Result<Self, MailError> {
        let sender = SenderConfig::from_env(overrides)?;
        let settings = SmtpSettings::from_env()?.with_sender_credentials(&sender);
        debug!("Using SMTP settings: {settings:?}");
        let transport = SmtpMailer::new(&settings)?;
        Ok(Self::new(sender, transport))
    }
}

impl<T> Mailer<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(sender: SenderConfig, transport: T) -> Self {
        Self {
            sender,
            rewriter: BodyRewriter::default(),
            resolver: AttachmentResolver::default(),
            transport,
        }
    }

    /// Directory relative references in bodies are resolved against.
    #[must_use]
    pub fn with_base_dir<P>(mut self, base_dir: P) -> Self
    where
        P: Into<PathBuf>,
    {
        self.rewriter = self.rewriter.with_base_dir(base_dir);
        self
    }

    #[must_use]
    pub fn with_rewriter(mut self, rewriter: BodyRewriter) -> Self {
        self.rewriter = rewriter;
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: AttachmentResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Getter for `sender`.
    #[must_use]
    pub fn sender(&self) -> &SenderConfig {
        &self.sender
    }

    /// Getter for `transport`.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Fresh composer using this mailer's settings.
    #[must_use]
    pub fn composer(&self) -> MailComposer {
        MailComposer::new(&self.sender)
            .with_rewriter(self.rewriter.clone())
            .with_resolver(self.resolver.clone())
    }

    pub fn send(&self, composer: MailComposer) -> Result<SendReport, MailError> {
        composer.try_send(&self.transport)
    }

    /// Sends every entry in order. Each entry gets its own result.
    pub fn send_batch(&self, entries: &[RecipientEntry]) -> Vec<Result<SendReport, MailError>> {
        let results: Vec<_> = entries
            .iter()
            .map(|entry| {
                let mut composer = self.composer();
                composer
                    .add_recipient(entry.recipient())
                    .set_subject(entry.subject.as_str())
                    .set_body(entry.body.as_str())
                    .add_attachments(entry.attachments.iter().cloned());
                composer.try_send(&self.transport)
            })
            .collect();

        let sent = results.iter().filter(|result| result.is_ok()).count();
        info!("Batch finished: {sent} of {} mail(s) sent", entries.len());
        results
    }

    /// Same as [`Mailer::send_batch`], collapsing each outcome to a flag.
    pub fn send_batch_compat(&self, entries: &[RecipientEntry]) -> Vec<bool> {
        self.send_batch(entries)
            .into_iter()
            .map(|result| result.is_ok())
            .collect()
    }
}
