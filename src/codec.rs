//! OSM API 0.6 XML documents: downloads, change uploads and their replies.

use quick_xml::events::attributes::Attribute;

use crate::errors::Result;

pub mod osm_change;
pub mod parse_osm;

pub use osm_change::{encode_changeset, encode_osm, encode_osm_change};
pub use parse_osm::{decode_diff_result, decode_osm, DiffResultEntry};

pub const API_VERSION: &str = "0.6";

fn attribute_value(attribute: &Attribute) -> Result<String> {
    Ok(attribute.unescape_value()?.into_owned())
}

fn attribute_parse<T>(attribute: &Attribute) -> Result<T>
where
    T: std::str::FromStr,
    crate::errors::Error: From<T::Err>,
{
    let value = std::str::from_utf8(&attribute.value)?;
    Ok(value.trim().parse::<T>()?)
}
