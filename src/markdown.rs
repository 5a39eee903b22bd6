//! Comment markdown to sanitised HTML.

use std::collections::HashSet;

use pulldown_cmark::{html, Event, Options, Parser, Tag, TagEnd};

#[derive(Debug, Clone, Copy)]
pub struct MarkdownOptions {
    pub links: bool,
    pub images: bool,
    pub tables: bool,
}

impl Default for MarkdownOptions {
    fn default() -> Self {
        Self { links: true, images: true, tables: true }
    }
}

const BASE_TAGS: &[&str] = &[
    "p", "br", "hr", "h1", "h2", "h3", "h4", "h5", "h6", "blockquote", "pre", "code", "em", "strong", "del", "ul", "ol", "li",
];
const TABLE_TAGS: &[&str] = &["table", "thead", "tbody", "tr", "th", "td"];

fn parser_options(opts: MarkdownOptions) -> Options {
    let mut o = Options::ENABLE_STRIKETHROUGH;
    if opts.tables {
        o |= Options::ENABLE_TABLES;
    }
    o
}

pub fn render(markdown: &str, opts: MarkdownOptions) -> String {
    // Dropping the tag events of a disabled link or image leaves its text (or alt text) behind
    let events = Parser::new_ext(markdown, parser_options(opts)).filter_map(|ev| match ev {
        Event::Start(Tag::Link { .. }) | Event::End(TagEnd::Link) if !opts.links => None,
        Event::Start(Tag::Image { .. }) | Event::End(TagEnd::Image) if !opts.images => None,
        // Raw HTML is shown literally
        Event::Html(s) | Event::InlineHtml(s) => Some(Event::Text(s)),
        other => Some(other),
    });
    let mut raw = String::with_capacity(markdown.len() * 2);
    html::push_html(&mut raw, events);
    sanitize(&raw, opts)
}

fn sanitize(raw: &str, opts: MarkdownOptions) -> String {
    let mut tags: HashSet<&str> = BASE_TAGS.iter().copied().collect();
    if opts.tables {
        tags.extend(TABLE_TAGS.iter().copied());
    }
    if opts.links {
        tags.insert("a");
    }
    if opts.images {
        tags.insert("img");
    }
    let mut b = ammonia::Builder::default();
    b.tags(tags)
        .add_tag_attributes("a", &["href", "title"])
        .add_tag_attributes("img", &["src", "alt", "title"])
        .link_rel(Some("nofollow noopener"))
        .set_tag_attribute_value("a", "target", "_blank");
    b.clean(raw).to_string().trim().to_string()
}

fn scan(markdown: &str, want: impl Fn(&Tag) -> bool) -> bool {
    Parser::new_ext(markdown, Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH).any(|ev| match ev {
        Event::Start(ref t) => want(t),
        _ => false,
    })
}

pub fn has_links(markdown: &str) -> bool {
    scan(markdown, |t| matches!(t, Tag::Link { .. })) || markdown.contains("http://") || markdown.contains("https://")
}

pub fn has_images(markdown: &str) -> bool {
    scan(markdown, |t| matches!(t, Tag::Image { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_get_rel_and_target() {
        let h = render("[site](https://example.com)", MarkdownOptions::default());
        assert!(h.contains("href=\"https://example.com\""), "{h}");
        assert!(h.contains("rel=\"nofollow noopener\""), "{h}");
        assert!(h.contains("target=\"_blank\""), "{h}");
    }

    #[test]
    fn disabled_links_keep_their_text() {
        let h = render("see [site](https://example.com)", MarkdownOptions { links: false, ..Default::default() });
        assert_eq!(h, "<p>see site</p>");
    }

    #[test]
    fn disabled_images_fall_back_to_alt_text() {
        let h = render("![a cat](https://example.com/cat.png)", MarkdownOptions { images: false, ..Default::default() });
        assert_eq!(h, "<p>a cat</p>");
    }

    #[test]
    fn scripts_never_survive() {
        let h = render("<script>alert(1)</script>\n\n**bold**", MarkdownOptions::default());
        assert!(!h.contains("<script"), "{h}");
        assert!(h.contains("<strong>bold</strong>"), "{h}");
        let h = render("[x](javascript:alert(1))", MarkdownOptions::default());
        assert!(!h.contains("javascript:"), "{h}");
    }

    #[test]
    fn tables_are_optional() {
        let md = "| a | b |\n|---|---|\n| 1 | 2 |";
        assert!(render(md, MarkdownOptions::default()).contains("<table>"));
        assert!(!render(md, MarkdownOptions { tables: false, ..Default::default() }).contains("<table>"));
    }

    #[test]
    fn detects_links_and_images() {
        assert!(has_links("go to https://example.com"));
        assert!(has_links("[x](/local)"));
        assert!(!has_links("plain text"));
        assert!(has_images("![x](y.png)"));
        assert!(!has_images("[x](y.png)"));
    }
}
