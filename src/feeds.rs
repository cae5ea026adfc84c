//! Sitemap and RSS rendering.
//!
//! Both documents list every published article plus every configured static
//! page, so N articles and M pages always produce N+M entries.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Write as _;

use crate::config::{Site, StaticPage};
use crate::db::{self, Pool};
use crate::model::Article;

/// Upper bound on articles pulled into a feed.
pub const MAX_FEED_ARTICLES: i64 = 1000;
const SUMMARY_CHARS: usize = 280;

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));
static SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid space regex"));

/// Everything that appears in the feeds.
#[derive(Debug, Clone, Default)]
pub struct SiteIndex {
    pub articles: Vec<Article>,
    pub pages: Vec<StaticPage>,
}

impl SiteIndex {
    pub fn len(&self) -> usize {
        self.articles.len() + self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub async fn load_index(pool: &Pool, site: &Site) -> Result<SiteIndex> {
    Ok(SiteIndex {
        articles: db::published_articles(pool, MAX_FEED_ARTICLES).await?,
        pages: site.static_pages.clone(),
    })
}

pub fn article_url(base_url: &str, slug: &str) -> String {
    format!("{}/articles/{}", base_url.trim_end_matches('/'), slug)
}

fn page_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// Escape text for use outside CDATA.
pub fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Wrap text in CDATA, splitting any `]]>` so the section cannot be closed
/// early.
pub fn cdata(input: &str) -> String {
    format!("<![CDATA[{}]]>", input.replace("]]>", "]]]]><![CDATA[>"))
}

/// RFC-822 date as used by RSS 2.0.
pub fn rfc822(ts: DateTime<Utc>) -> String {
    ts.format("%a, %d %b %Y %H:%M:%S +0000").to_string()
}

fn iso_date(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

/// Plain-text summary: the excerpt if present, else the stripped body.
fn summary(article: &Article) -> String {
    if let Some(excerpt) = article.excerpt.as_deref().filter(|e| !e.trim().is_empty()) {
        return excerpt.trim().to_string();
    }
    let text = TAG_RE.replace_all(&article.content, " ");
    let text = SPACE_RE.replace_all(text.trim(), " ");
    if text.chars().count() <= SUMMARY_CHARS {
        return text.into_owned();
    }
    let mut cut: String = text.chars().take(SUMMARY_CHARS).collect();
    cut.push('…');
    cut
}

pub fn render_sitemap(base_url: &str, index: &SiteIndex, today: NaiveDate) -> String {
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">\n",
    );
    let today = today.format("%Y-%m-%d").to_string();
    for page in &index.pages {
        push_url(
            &mut out,
            &page_url(base_url, &page.path),
            &today,
            &page.changefreq,
            page.priority,
        );
    }
    for article in &index.articles {
        push_url(
            &mut out,
            &article_url(base_url, &article.slug),
            &iso_date(article.updated_at),
            "weekly",
            0.7,
        );
    }
    out.push_str("</urlset>\n");
    out
}

fn push_url(out: &mut String, loc: &str, lastmod: &str, changefreq: &str, priority: f32) {
    let _ = write!(
        out,
        "  <url>\n    <loc>{}</loc>\n    <lastmod>{}</lastmod>\n    <changefreq>{}</changefreq>\n    <priority>{:.1}</priority>\n  </url>\n",
        xml_escape(loc),
        lastmod,
        xml_escape(changefreq),
        priority
    );
}

pub fn render_rss(site: &Site, index: &SiteIndex, now: DateTime<Utc>) -> String {
    let base = site.base_url.trim_end_matches('/');
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <rss version=\"2.0\" xmlns:atom=\"http://www.w3.org/2005/Atom\">\n<channel>\n",
    );
    let _ = write!(
        out,
        "  <title>{}</title>\n  <link>{}</link>\n  <description>{}</description>\n  <language>{}</language>\n  <lastBuildDate>{}</lastBuildDate>\n  <atom:link href=\"{}/rss.xml\" rel=\"self\" type=\"application/rss+xml\"/>\n",
        cdata(&site.name),
        xml_escape(base),
        cdata(&site.description),
        xml_escape(&site.language),
        rfc822(now),
        xml_escape(base),
    );

    for article in &index.articles {
        let link = article_url(base, &article.slug);
        let published = article.published_at.unwrap_or(article.updated_at);
        push_item(&mut out, &article.title, &summary(article), &link, published, article.category.as_deref());
    }
    for page in &index.pages {
        let link = page_url(base, &page.path);
        push_item(&mut out, &page.title, &page.description, &link, now, None);
    }

    out.push_str("</channel>\n</rss>\n");
    out
}

fn push_item(
    out: &mut String,
    title: &str,
    description: &str,
    link: &str,
    published: DateTime<Utc>,
    category: Option<&str>,
) {
    out.push_str("  <item>\n");
    let _ = writeln!(out, "    <title>{}</title>", cdata(title));
    let _ = writeln!(out, "    <link>{}</link>", xml_escape(link));
    let _ = writeln!(out, "    <guid isPermaLink=\"true\">{}</guid>", xml_escape(link));
    let _ = writeln!(out, "    <description>{}</description>", cdata(description));
    let _ = writeln!(out, "    <pubDate>{}</pubDate>", rfc822(published));
    if let Some(category) = category {
        let _ = writeln!(out, "    <category>{}</category>", cdata(category));
    }
    out.push_str("  </item>\n");
}
