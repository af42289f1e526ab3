use std::str::FromStr;

use lettre::{
    Address, Message,
    message::{Body, Mailbox, MultiPart, SinglePart, header::ContentType},
};

use crate::{attachment::AttachmentItem, error::MailError, rewrite::EmbeddedResource};

fn content_type(value: &str) -> Result<ContentType, MailError> {
    ContentType::parse(value).map_err(|_| MailError::InvalidContentType(value.to_string()))
}

impl TryFrom<AttachmentItem> for SinglePart {
    type Error = MailError;

    fn try_from(attachment: AttachmentItem) -> Result<Self, Self::Error> {
        let (filename, content_type_value, content) = attachment.into_parts();
        Ok(lettre::message::Attachment::new(filename)
            .body(Body::new(content), content_type(&content_type_value)?))
    }
}

impl TryFrom<EmbeddedResource> for SinglePart {
    type Error = MailError;

    fn try_from(resource: EmbeddedResource) -> Result<Self, Self::Error> {
        let (content_id, content_type_value, content) = resource.into_parts();
        Ok(lettre::message::Attachment::new_inline(content_id)
            .body(Body::new(content), content_type(&content_type_value)?))
    }
}

/// Mail address with an optional display name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recipient {
    pub address: String,
    pub name: Option<String>,
}

impl Recipient {
    #[must_use]
    pub fn new<A>(address: A) -> Self
    where
        A: Into<String>,
    {
        Self {
            address: address.into(),
            name: None,
        }
    }

    #[must_use]
    pub fn named<N, A>(name: N, address: A) -> Self
    where
        N: Into<String>,
        A: Into<String>,
    {
        let name = name.into();
        Self {
            address: address.into(),
            name: (!name.is_empty()).then_some(name),
        }
    }

    pub fn mailbox(&self) -> Result<Mailbox, MailError> {
        let address = Address::from_str(self.address.trim())?;
        Ok(Mailbox::new(self.name.clone(), address))
    }
}

/// Fully composed message, independent of any transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub(crate) from: Mailbox,
    pub(crate) to: Vec<Recipient>,
    pub(crate) cc: Vec<Recipient>,
    pub(crate) bcc: Vec<Recipient>,
    pub(crate) reply_to: Option<Recipient>,
    pub(crate) subject: String,
    pub(crate) html: String,
    pub(crate) plain: String,
    pub(crate) embedded: Vec<EmbeddedResource>,
    pub(crate) attachments: Vec<AttachmentItem>,
}

impl OutboundMessage {
    /// Getter for `from`.
    #[must_use]
    pub fn from(&self) -> &Mailbox {
        &self.from
    }

    /// Getter for `to`.
    #[must_use]
    pub fn to(&self) -> &[Recipient] {
        &self.to
    }

    #[must_use]
    pub fn cc(&self) -> &[Recipient] {
        &self.cc
    }

    #[must_use]
    pub fn bcc(&self) -> &[Recipient] {
        &self.bcc
    }

    #[must_use]
    pub fn reply_to(&self) -> Option<&Recipient> {
        self.reply_to.as_ref()
    }

    /// Getter for `subject`.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Rewritten HTML body.
    #[must_use]
    pub fn html(&self) -> &str {
        &self.html
    }

    /// Plain-text alternative body.
    #[must_use]
    pub fn plain(&self) -> &str {
        &self.plain
    }

    /// Embedded resources, one per content identifier.
    #[must_use]
    pub fn embedded(&self) -> &[EmbeddedResource] {
        &self.embedded
    }

    #[must_use]
    pub fn attachments(&self) -> &[AttachmentItem] {
        &self.attachments
    }

    /// Primary recipient addresses, for logging.
    #[must_use]
    pub fn recipients(&self) -> String {
        self.to
            .iter()
            .map(|recipient| recipient.address.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Converts OutboundMessage to lettre Message.
    /// Message structure should look like this:
    /// - multipart mixed
    ///   - multipart alternative
    ///     - singlepart: plain text
    ///     - multipart related
    ///       - singlepart: HTML version
    ///       - singlepart: embedded resource 1
    ///       - singlepart: embedded resource 2
    ///   - singlepart: attachments
    pub fn to_message(&self) -> Result<Message, MailError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(self.subject.clone());
        for recipient in &self.to {
            builder = builder.to(recipient.mailbox()?);
        }
        for recipient in &self.cc {
            builder = builder.cc(recipient.mailbox()?);
        }
        for recipient in &self.bcc {
            builder = builder.bcc(recipient.mailbox()?);
        }
        if let Some(reply_to) = &self.reply_to {
            builder = builder.reply_to(reply_to.mailbox()?);
        }

        let plain = SinglePart::plain(self.plain.clone());
        let html = SinglePart::html(self.html.clone());
        let mut related = MultiPart::related().singlepart(html);
        for resource in &self.embedded {
            related = related.singlepart(resource.clone().try_into()?);
        }
        let alternative = MultiPart::alternative()
            .singlepart(plain)
            .multipart(related);

        let mut mixed = MultiPart::mixed().multipart(alternative);
        for attachment in &self.attachments {
            mixed = mixed.singlepart(attachment.clone().try_into()?);
        }

        Ok(builder.multipart(mixed)?)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use claims::{assert_err, assert_matches, assert_ok};

    use super::*;
    use crate::{attachment::AttachmentOrigin, rewrite::content_id};

    fn message() -> OutboundMessage {
        let id = content_id("logo.png");
        OutboundMessage {
            from: Mailbox::new(
                Some("Sender".into()),
                Address::from_str("sender@example.com").unwrap(),
            ),
            to: vec![Recipient::named("Jane", "jane@example.com")],
            cc: vec![Recipient::new("cc@example.com")],
            bcc: vec![Recipient::new("bcc@example.com")],
            reply_to: Some(Recipient::new("reply@example.com")),
            subject: "Report".into(),
            html: format!("<p>Hi</p><img src=\"cid:{id}\">"),
            plain: "Hi".into(),
            embedded: vec![EmbeddedResource::new(
                id,
                PathBuf::from("logo.png"),
                b"png".to_vec(),
            )],
            attachments: vec![AttachmentItem::new(
                "report.csv",
                b"a,b".to_vec(),
                AttachmentOrigin::InlineData,
            )],
        }
    }

    #[test]
    fn test_to_message_structure() {
        let message = assert_ok!(message().to_message());
        let formatted = String::from_utf8(message.formatted()).unwrap();

        assert!(formatted.contains("multipart/mixed"));
        assert!(formatted.contains("multipart/alternative"));
        assert!(formatted.contains("multipart/related"));
        assert!(formatted.contains(&format!("Content-ID: <{}>", content_id("logo.png"))));
        assert!(formatted.contains("filename=\"report.csv\""));
        assert!(formatted.contains("Reply-To: reply@example.com"));
        assert!(!formatted.contains("bcc@example.com"));

        let recipients = message.envelope().to();
        assert_eq!(recipients.len(), 3);
    }

    #[test]
    fn test_invalid_recipient() {
        let mut message = message();
        message.to = vec![Recipient::new("not an address")];
        assert_matches!(message.to_message(), Err(MailError::AddressError(_)));
    }

    #[test]
    fn test_invalid_content_type() {
        let mut message = message();
        message.attachments = vec![
            AttachmentItem::new("x", Vec::new(), AttachmentOrigin::InlineData)
                .with_content_type("not a type"),
        ];
        let err = assert_err!(message.to_message());
        assert_matches!(err, MailError::InvalidContentType(_));
    }

    #[test]
    fn test_recipient_named_empty_name() {
        assert_eq!(Recipient::named("", "a@example.com"), Recipient::new("a@example.com"));
        let mailbox = assert_ok!(Recipient::named("A", " a@example.com ").mailbox());
        assert_eq!(mailbox.to_string(), "A <a@example.com>");
    }
}
