//! Typed records produced from raw archive lines.

use crate::config::LINK_PREFIX;
use crate::error::RecordError;
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A decoded line before validation.
pub type RawRecord = Map<String, Value>;

/// A validated record with a unique identifier, insertable into one table.
pub trait Record: Sized {
    const KIND: &'static str;
    const TABLE: &'static str;
    /// Column names in the order produced by [`values`](Record::values). The first is the id.
    const COLUMNS: &'static [&'static str];

    fn from_raw(raw: RawRecord) -> Result<Self, RecordError>;
    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn values(&self) -> Vec<SqlValue>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub subreddit: String,
    pub title: String,
    #[serde(default)]
    pub selftext: Option<String>,
    pub author: String,
    #[serde(deserialize_with = "de_int")]
    pub created_utc: i64,
    #[serde(deserialize_with = "de_int")]
    pub num_comments: i64,
    #[serde(deserialize_with = "de_int")]
    pub score: i64,
    pub url: String,
    #[serde(default, deserialize_with = "de_flag")]
    pub archived: bool,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default, deserialize_with = "de_flag")]
    pub over_18: bool,
    pub permalink: String,
    #[serde(default, deserialize_with = "de_flag")]
    pub is_video: bool,
}

impl Record for Post {
    const KIND: &'static str = "post";
    const TABLE: &'static str = "post";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "subreddit",
        "title",
        "selftext",
        "author",
        "created_utc",
        "num_comments",
        "score",
        "url",
        "archived",
        "domain",
        "over_18",
        "permalink",
        "is_video",
    ];

    fn from_raw(mut raw: RawRecord) -> Result<Self, RecordError> {
        lowercase_subreddit(&mut raw);
        serde_json::from_value(Value::Object(raw)).map_err(|source| RecordError::Invalid {
            kind: Self::KIND,
            source,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.id.clone().into(),
            self.subreddit.clone().into(),
            self.title.clone().into(),
            opt_text(&self.selftext),
            self.author.clone().into(),
            self.created_utc.into(),
            self.num_comments.into(),
            self.score.into(),
            self.url.clone().into(),
            flag(self.archived),
            opt_text(&self.domain),
            flag(self.over_18),
            self.permalink.clone().into(),
            flag(self.is_video),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    /// Empty when the dump omits it.
    #[serde(default, deserialize_with = "de_text")]
    pub subreddit: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default, deserialize_with = "de_opt_int")]
    pub created_utc: Option<i64>,
    #[serde(default)]
    pub link_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_int")]
    pub controversiality: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_int")]
    pub ups: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_int")]
    pub score: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_int")]
    pub gilded: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_int")]
    pub retrieved_on: Option<i64>,
    #[serde(default)]
    pub distinguished: Option<String>,
    /// Parent post id, derived from a `t3_` prefixed `link_id`.
    #[serde(default)]
    pub post_id: Option<String>,
}

impl Record for Comment {
    const KIND: &'static str = "comment";
    const TABLE: &'static str = "comment";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "subreddit",
        "author",
        "body",
        "created_utc",
        "link_id",
        "controversiality",
        "ups",
        "score",
        "gilded",
        "retrieved_on",
        "distinguished",
        "post_id",
    ];

    fn from_raw(mut raw: RawRecord) -> Result<Self, RecordError> {
        lowercase_subreddit(&mut raw);
        let post_id = raw
            .get("link_id")
            .and_then(Value::as_str)
            .and_then(|link| link.strip_prefix(LINK_PREFIX))
            .map(str::to_string);
        if let Some(post_id) = post_id {
            raw.insert("post_id".to_string(), Value::String(post_id));
        }
        serde_json::from_value(Value::Object(raw)).map_err(|source| RecordError::Invalid {
            kind: Self::KIND,
            source,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.id.clone().into(),
            self.subreddit.clone().into(),
            opt_text(&self.author),
            opt_text(&self.body),
            opt_int(self.created_utc),
            opt_text(&self.link_id),
            opt_int(self.controversiality),
            opt_int(self.ups),
            opt_int(self.score),
            opt_int(self.gilded),
            opt_int(self.retrieved_on),
            opt_text(&self.distinguished),
            opt_text(&self.post_id),
        ]
    }
}

fn lowercase_subreddit(raw: &mut RawRecord) {
    if let Some(Value::String(s)) = raw.get_mut("subreddit") {
        *s = s.to_lowercase();
    }
}

fn opt_text(value: &Option<String>) -> SqlValue {
    value.clone().map_or(SqlValue::Null, SqlValue::Text)
}

fn opt_int(value: Option<i64>) -> SqlValue {
    value.map_or(SqlValue::Null, SqlValue::Integer)
}

fn flag(value: bool) -> SqlValue {
    SqlValue::Integer(value as i64)
}

// Dumps from different years disagree on types: ids and timestamps show up as
// strings, numbers or floats, and booleans occasionally as null.

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Int(i64),
    Float(f64),
    Text(String),
}

fn lenient_to_int<E: serde::de::Error>(value: Lenient) -> Result<i64, E> {
    match value {
        Lenient::Int(n) => Ok(n),
        Lenient::Float(f) if f.is_finite() => Ok(f as i64),
        Lenient::Float(f) => Err(E::custom(format!("non-finite number {f}"))),
        Lenient::Text(s) => s
            .trim()
            .parse::<i64>()
            .or_else(|_| s.trim().parse::<f64>().map(|f| f as i64))
            .map_err(|_| E::custom(format!("expected an integer, got {s:?}"))),
    }
}

fn de_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    lenient_to_int(Lenient::deserialize(deserializer)?)
}

fn de_opt_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    match Option::<Lenient>::deserialize(deserializer)? {
        Some(value) => lenient_to_int(value).map(Some),
        None => Ok(None),
    }
}

fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Lenient::deserialize(deserializer)? {
        Lenient::Text(s) if !s.is_empty() => Ok(s),
        Lenient::Text(_) => Err(serde::de::Error::custom("empty id")),
        Lenient::Int(n) => Ok(n.to_string()),
        Lenient::Float(f) => Err(serde::de::Error::custom(format!("float id {f}"))),
    }
}

fn de_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn de_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn post_json() -> Value {
        json!({
            "id": "123",
            "subreddit": "Python",
            "title": "Test Post",
            "selftext": "This is a test post",
            "author": "test_user",
            "created_utc": 1638316800,
            "num_comments": 10,
            "score": 100,
            "url": "https://example.com",
            "archived": false,
            "domain": "example.com",
            "permalink": "/r/python/comments/12345/test_post/",
            "is_video": false,
            "gildings": {}
        })
    }

    #[test]
    fn post_lowercases_subreddit() {
        let post = Post::from_raw(raw(post_json())).unwrap();
        assert_eq!(post.id, "123");
        assert_eq!(post.subreddit, "python");
        assert_eq!(post.selftext.as_deref(), Some("This is a test post"));
        assert_eq!(post.created_utc, 1638316800);
        assert!(!post.over_18);
    }

    #[test]
    fn post_optional_fields_default() {
        let post = Post::from_raw(raw(json!({
            "id": "456",
            "subreddit": "python",
            "title": "Partial Test Post",
            "author": "test_user",
            "created_utc": 1638316800,
            "num_comments": 5,
            "score": 50,
            "url": "https://example.com",
            "permalink": "/r/python/comments/67890/partial_test_post/",
        })))
        .unwrap();
        assert!(post.selftext.is_none());
        assert!(post.domain.is_none());
        assert!(!post.archived);
        assert!(!post.is_video);
    }

    #[test]
    fn post_missing_required_field_is_rejected() {
        let mut value = post_json();
        value.as_object_mut().unwrap().remove("title");
        let err = Post::from_raw(raw(value)).unwrap_err();
        assert!(err.to_string().contains("invalid post record"));
    }

    #[test]
    fn post_accepts_stringly_typed_numbers() {
        let mut value = post_json();
        value["created_utc"] = json!("1325376000");
        value["score"] = json!(12.0);
        value["over_18"] = Value::Null;
        let post = Post::from_raw(raw(value)).unwrap();
        assert_eq!(post.created_utc, 1325376000);
        assert_eq!(post.score, 12);
        assert!(!post.over_18);
    }

    #[test]
    fn numeric_id_is_stringified() {
        let mut value = post_json();
        value["id"] = json!(987);
        assert_eq!(Post::from_raw(raw(value)).unwrap().id, "987");
    }

    #[test]
    fn empty_id_is_rejected() {
        let mut value = post_json();
        value["id"] = json!("");
        assert!(Post::from_raw(raw(value)).is_err());
    }

    #[test]
    fn comment_derives_post_id_from_link() {
        let comment = Comment::from_raw(raw(json!({
            "id": "c1",
            "subreddit": "BitCoin",
            "author": "vitalik",
            "body": "Nice post!",
            "created_utc": "1641223800",
            "link_id": "t3_p1",
            "score": 5,
        })))
        .unwrap();
        assert_eq!(comment.subreddit, "bitcoin");
        assert_eq!(comment.post_id.as_deref(), Some("p1"));
        assert_eq!(comment.created_utc, Some(1641223800));
        assert_eq!(comment.link_id.as_deref(), Some("t3_p1"));
    }

    #[test]
    fn comment_without_link_prefix_has_no_post() {
        let comment = Comment::from_raw(raw(json!({"id": "c2", "link_id": "t1_parent"}))).unwrap();
        assert!(comment.post_id.is_none());

        let comment = Comment::from_raw(raw(json!({"id": "c3"}))).unwrap();
        assert!(comment.post_id.is_none());
    }

    #[test]
    fn comment_without_subreddit_stores_empty_text() {
        let missing = Comment::from_raw(raw(json!({"id": "c4"}))).unwrap();
        assert_eq!(missing.subreddit, "");
        assert_eq!(missing.values()[1], SqlValue::Text(String::new()));

        let null = Comment::from_raw(raw(json!({"id": "c5", "subreddit": null}))).unwrap();
        assert_eq!(null.subreddit, "");
    }

    #[test]
    fn values_follow_column_order() {
        let post = Post::from_raw(raw(post_json())).unwrap();
        let values = post.values();
        assert_eq!(values.len(), Post::COLUMNS.len());
        assert_eq!(values[0], SqlValue::Text("123".into()));
        assert_eq!(values[3], SqlValue::Text("This is a test post".into()));
        assert_eq!(values[9], SqlValue::Integer(0));

        let comment = Comment::from_raw(raw(json!({"id": "c1", "link_id": "t3_p9"}))).unwrap();
        let values = comment.values();
        assert_eq!(values.len(), Comment::COLUMNS.len());
        assert_eq!(values[3], SqlValue::Null);
        assert_eq!(values[12], SqlValue::Text("p9".into()));
    }

    #[test]
    fn set_id_rewrites_identifier() {
        let mut comment = Comment::from_raw(raw(json!({"id": "c1"}))).unwrap();
        comment.set_id("c1_deadbeef".into());
        assert_eq!(comment.id(), "c1_deadbeef");
    }
}
