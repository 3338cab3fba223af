use quick_xml::events::Event;
use quick_xml::reader::Reader;
use thiserror::Error;

use crate::feed::model::Entry;

/// Document-level parse failures. Per-item problems never surface here;
/// malformed items are dropped and counted in [`ParsedFeed::skipped`].
#[derive(Debug, Error)]
pub enum ParseError {
    /// The payload is not well-formed XML.
    #[error("malformed feed document: {0}")]
    Malformed(String),
    /// Well-formed XML with no `<channel>` element, e.g. an HTML error page
    /// served with a 200 status.
    #[error("document contains no RSS channel")]
    NotAFeed,
}

/// Structured result of parsing one feed document.
///
/// `title` and `ttl_seconds` are `None` when the channel omits them (or the
/// ttl is non-numeric) so the caller can retain its previous values. The ttl
/// is reported as parsed; flooring is the merge step's concern.
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub ttl_seconds: Option<i64>,
    pub entries: Vec<Entry>,
    /// Items dropped from the document: missing one of the required fields,
    /// or carrying a guid an earlier item already used.
    pub skipped: usize,
}

/// Parse an RSS 2.0 document into a [`ParsedFeed`].
///
/// Pure function: no network access, no stored state. An item missing any
/// of `title`, `link`, `guid`, `description`, or `pubDate` is skipped and
/// counted without failing the document; XML that is not well-formed fails
/// the whole document and yields no partial entries.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut parsed = ParsedFeed::default();
    let mut path: Vec<String> = Vec::new();
    let mut item: Option<ItemBuilder> = None;
    let mut channel_title: Option<String> = None;
    let mut channel_ttl: Option<String> = None;
    let mut seen_channel = false;
    let mut seen_guids = std::collections::HashSet::new();
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ParseError::Malformed(e.to_string()))?;
        match event {
            Event::Start(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                if name == "channel" {
                    seen_channel = true;
                }
                if name == "item" && item.is_none() {
                    item = Some(ItemBuilder::default());
                }
                path.push(name);
            }
            Event::End(end) => {
                let end_name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                let name = path.pop().unwrap_or_default();
                if name != end_name {
                    return Err(ParseError::Malformed(format!(
                        "mismatched closing tag: expected </{name}>, found </{end_name}>"
                    )));
                }
                if name == "item" {
                    if let Some(builder) = item.take() {
                        match builder.build(parsed.entries.len()) {
                            // A guid repeated within one document keeps its
                            // first occurrence
                            Some(entry) => {
                                if seen_guids.insert(entry.guid.clone()) {
                                    parsed.entries.push(entry);
                                } else {
                                    parsed.skipped += 1;
                                }
                            }
                            None => parsed.skipped += 1,
                        }
                    }
                }
            }
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|e| ParseError::Malformed(e.to_string()))?;
                capture(&path, &mut item, &mut channel_title, &mut channel_ttl, &text);
            }
            Event::CData(cdata) => {
                let bytes = cdata.into_inner();
                let text = String::from_utf8_lossy(&bytes);
                capture(&path, &mut item, &mut channel_title, &mut channel_ttl, &text);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !path.is_empty() {
        return Err(ParseError::Malformed("unexpected end of document".into()));
    }
    if !seen_channel {
        return Err(ParseError::NotAFeed);
    }

    parsed.title = channel_title;
    parsed.ttl_seconds = channel_ttl.and_then(|ttl| ttl.trim().parse().ok());
    Ok(parsed)
}

/// Route a text node to the field its element path addresses. Only direct
/// children of `<item>` and `<channel>` are considered, so `<image><title>`
/// cannot clobber the channel title.
fn capture(
    path: &[String],
    item: &mut Option<ItemBuilder>,
    channel_title: &mut Option<String>,
    channel_ttl: &mut Option<String>,
    text: &str,
) {
    let Some(element) = path.last() else { return };
    let parent = path.len().checked_sub(2).map(|i| path[i].as_str());

    if let Some(builder) = item.as_mut() {
        if parent == Some("item") {
            builder.append(element, text);
        }
    } else if parent == Some("channel") {
        match element.as_str() {
            "title" => append(channel_title, text),
            "ttl" => append(channel_ttl, text),
            _ => {}
        }
    }
}

// Text content can arrive as multiple events (text mixed with CDATA), so
// fields accumulate rather than overwrite.
fn append(slot: &mut Option<String>, text: &str) {
    match slot {
        Some(existing) => existing.push_str(text),
        None => *slot = Some(text.to_owned()),
    }
}

#[derive(Default)]
struct ItemBuilder {
    title: Option<String>,
    link: Option<String>,
    guid: Option<String>,
    description: Option<String>,
    pub_date: Option<String>,
}

impl ItemBuilder {
    fn append(&mut self, element: &str, text: &str) {
        let slot = match element {
            "title" => &mut self.title,
            "link" => &mut self.link,
            "guid" => &mut self.guid,
            "description" => &mut self.description,
            "pubDate" => &mut self.pub_date,
            _ => return,
        };
        append(slot, text);
    }

    /// All five fields are required; an incomplete item yields `None`.
    fn build(self, sequence_index: usize) -> Option<Entry> {
        Some(Entry {
            sequence_index,
            title: self.title?,
            link: self.link?,
            guid: self.guid?,
            description: self.description?,
            published_at: self.pub_date?,
            read: false,
        })
    }
}
