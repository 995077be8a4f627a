//! Torznab XML result parsing
//!
//! Several trackers (and Prowlarr) answer searches with RSS 2.0 plus
//! Torznab attribute extensions. Parsed with a streaming reader; items
//! missing optional attributes still produce a usable result.

use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;

/// One release item from a Torznab feed.
#[derive(Debug, Clone, Default)]
pub struct TorznabItem {
    pub title: String,
    pub guid: String,
    pub link: Option<String>,
    pub size: i64,
    pub seeders: i32,
    pub leechers: i32,
    pub info_hash: Option<String>,
    pub tmdb_id: Option<i64>,
    pub imdb_id: Option<String>,
    pub pub_date: Option<String>,
    pub category: Option<String>,
}

/// Parse the `<item>` entries of a Torznab RSS document.
pub fn parse_torznab(xml: &str) -> Result<Vec<TorznabItem>> {
    let mut reader = Reader::from_str(xml);
    let mut items = Vec::new();
    let mut current: Option<TorznabItem> = None;
    let mut text_target: Option<&'static str> = None;

    loop {
        match reader.read_event().context("malformed Torznab XML")? {
            Event::Start(e) => match e.name().as_ref() {
                b"item" => current = Some(TorznabItem::default()),
                b"title" if current.is_some() => text_target = Some("title"),
                b"guid" if current.is_some() => text_target = Some("guid"),
                b"link" if current.is_some() => text_target = Some("link"),
                b"pubDate" if current.is_some() => text_target = Some("pub_date"),
                b"category" if current.is_some() => text_target = Some("category"),
                b"size" if current.is_some() => text_target = Some("size"),
                _ => text_target = None,
            },
            Event::Empty(e) => {
                let name = e.name();
                let tag = name.as_ref();
                if let Some(item) = current.as_mut() {
                    if tag == b"enclosure" {
                        for attr in e.attributes().flatten() {
                            match attr.key.as_ref() {
                                b"url" => {
                                    if item.link.is_none() {
                                        item.link =
                                            Some(attr.unescape_value()?.into_owned());
                                    }
                                }
                                b"length" => {
                                    if item.size == 0 {
                                        item.size = attr
                                            .unescape_value()?
                                            .parse()
                                            .unwrap_or(0);
                                    }
                                }
                                _ => {}
                            }
                        }
                    } else if tag == b"torznab:attr" || tag == b"attr" {
                        let mut attr_name = String::new();
                        let mut attr_value = String::new();
                        for attr in e.attributes().flatten() {
                            match attr.key.as_ref() {
                                b"name" => attr_name = attr.unescape_value()?.into_owned(),
                                b"value" => attr_value = attr.unescape_value()?.into_owned(),
                                _ => {}
                            }
                        }
                        apply_torznab_attr(item, &attr_name, &attr_value);
                    }
                }
            }
            Event::Text(t) => {
                if let (Some(item), Some(target)) = (current.as_mut(), text_target) {
                    let text = t.unescape()?.trim().to_string();
                    if text.is_empty() {
                        continue;
                    }
                    match target {
                        "title" => item.title = text,
                        "guid" => item.guid = text,
                        "link" => item.link = Some(text),
                        "pub_date" => item.pub_date = Some(text),
                        "category" if item.category.is_none() => item.category = Some(text),
                        "size" => item.size = text.parse().unwrap_or(item.size),
                        _ => {}
                    }
                }
            }
            Event::End(e) => {
                text_target = None;
                if e.name().as_ref() == b"item" {
                    if let Some(item) = current.take() {
                        items.push(item);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(items)
}

fn apply_torznab_attr(item: &mut TorznabItem, name: &str, value: &str) {
    match name {
        "seeders" => item.seeders = value.parse().unwrap_or(0),
        "peers" | "leechers" => item.leechers = value.parse().unwrap_or(0),
        "size" if item.size == 0 => item.size = value.parse().unwrap_or(0),
        "infohash" => item.info_hash = Some(value.to_string()),
        "tmdbid" => item.tmdb_id = value.parse().ok(),
        "imdbid" => {
            item.imdb_id = Some(if value.starts_with("tt") {
                value.to_string()
            } else {
                format!("tt{value}")
            })
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:torznab="http://torznab.com/schemas/2015/feed">
  <channel>
    <title>Demo Tracker</title>
    <item>
      <title>The.Movie.2021.1080p.WEB-DL.H264-X</title>
      <guid>https://demo.example/torrent/123</guid>
      <link>https://demo.example/download/123</link>
      <pubDate>Mon, 01 Mar 2021 10:00:00 +0000</pubDate>
      <category>2040</category>
      <enclosure url="https://demo.example/dl/123.torrent" length="15032385536" type="application/x-bittorrent"/>
      <torznab:attr name="seeders" value="12"/>
      <torznab:attr name="peers" value="15"/>
      <torznab:attr name="infohash" value="abcdef0123456789"/>
      <torznab:attr name="tmdbid" value="550"/>
      <torznab:attr name="imdbid" value="0137523"/>
    </item>
    <item>
      <title>Bare.Minimum.Release</title>
      <guid>bare-guid</guid>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_full_item() {
        let items = parse_torznab(SAMPLE).unwrap();
        assert_eq!(items.len(), 2);

        let item = &items[0];
        assert_eq!(item.title, "The.Movie.2021.1080p.WEB-DL.H264-X");
        assert_eq!(item.size, 15_032_385_536);
        assert_eq!(item.seeders, 12);
        assert_eq!(item.leechers, 15);
        assert_eq!(item.tmdb_id, Some(550));
        assert_eq!(item.imdb_id.as_deref(), Some("tt0137523"));
        assert_eq!(item.info_hash.as_deref(), Some("abcdef0123456789"));
        assert_eq!(item.link.as_deref(), Some("https://demo.example/download/123"));
    }

    #[test]
    fn test_parse_minimal_item() {
        let items = parse_torznab(SAMPLE).unwrap();
        let bare = &items[1];
        assert_eq!(bare.title, "Bare.Minimum.Release");
        assert_eq!(bare.size, 0);
        assert_eq!(bare.seeders, 0);
        assert!(bare.tmdb_id.is_none());
    }

    #[test]
    fn test_parse_rejects_mismatched_tags() {
        assert!(parse_torznab("<rss><item></wrong></rss>").is_err());
    }
}
