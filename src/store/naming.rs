//! Image naming conventions.
//!
//! Images are named `<instance name>-<MMDDYY>` so a plain name listing is
//! enough to regroup them by instance. Descriptions read like
//! `VPC Informational Server as of 03/10/2024`.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use super::model::SourceEntity;

pub const CLOUDFORMATION_STACK_TAG: &str = "aws:cloudformation:stack-name";

pub fn image_name(entity_name: &str, today: NaiveDate) -> String {
    format!("{entity_name}-{}", today.format("%m%d%y"))
}

/// Instance name an image belongs to, or None if the name has no date suffix.
pub fn owner_of_image(image_name: &str) -> Option<&str> {
    let pos = image_name.rfind('-')?;
    let (owner, suffix) = (&image_name[..pos], &image_name[pos + 1..]);
    if owner.is_empty() || suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(owner)
}

/// Human readable description for a new image.
///
/// Names prefixed with `ec2-` or `vpc-` are looked up without the prefix and
/// the prefix is rendered in front of the description.
pub fn image_description(
    entity: &SourceEntity,
    descriptions: &BTreeMap<String, String>,
    today: NaiveDate,
) -> String {
    let (prefix, short_name) = split_network_prefix(&entity.name);

    let desc = descriptions
        .get(short_name)
        .map(String::as_str)
        .or_else(|| entity.tag(CLOUDFORMATION_STACK_TAG))
        .unwrap_or("Unknown");

    let desc = match prefix {
        Some(prefix) => format!("{prefix} {desc}"),
        None => desc.to_string(),
    };

    format!("{desc} as of {}", today.format("%m/%d/%Y"))
}

fn split_network_prefix(name: &str) -> (Option<&'static str>, &str) {
    if let Some(rest) = name.strip_prefix("ec2-") {
        (Some("EC2"), rest)
    } else if let Some(rest) = name.strip_prefix("vpc-") {
        (Some("VPC"), rest)
    } else {
        (None, name)
    }
}

/// Image id referenced by a snapshot created alongside an image.
///
/// Expects `Created by CreateImage(i-…) for ami-… from vol-…`.
pub fn snapshot_image_id(description: &str) -> Option<&str> {
    let rest = description.strip_prefix("Created by CreateImage(i-")?;
    let (instance, rest) = rest.split_once(") for ")?;
    if !is_resource_suffix(instance) {
        return None;
    }

    let (image_id, volume) = rest.split_once(" from vol-")?;
    let image_suffix = image_id.strip_prefix("ami-")?;
    if !is_resource_suffix(image_suffix) || !volume.bytes().take_while(|b| !b.is_ascii_whitespace()).all(is_id_byte) {
        return None;
    }

    Some(image_id)
}

fn is_resource_suffix(s: &str) -> bool {
    s.len() >= 8 && s.bytes().all(is_id_byte)
}

fn is_id_byte(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, tags: &[(&str, &str)]) -> SourceEntity {
        SourceEntity {
            id: "i-0123456789abcdef0".to_string(),
            name: name.to_string(),
            state: "running".to_string(),
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn march_10() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
    }

    #[test]
    fn image_name_uses_short_date() {
        assert_eq!(image_name("infosrv", march_10()), "infosrv-031024");
    }

    #[test]
    fn owner_strips_date_suffix() {
        assert_eq!(owner_of_image("infosrv-031024"), Some("infosrv"));
        assert_eq!(owner_of_image("vpc-openvpn-010123"), Some("vpc-openvpn"));
        assert_eq!(owner_of_image("golden-base"), None);
        assert_eq!(owner_of_image("nodash"), None);
        assert_eq!(owner_of_image("-031024"), None);
        assert_eq!(owner_of_image("trailing-"), None);
    }

    #[test]
    fn description_from_table_with_prefix() {
        let mut table = BTreeMap::new();
        table.insert("infosrv".to_string(), "Informational Server".to_string());

        let desc = image_description(&entity("vpc-infosrv", &[]), &table, march_10());
        assert_eq!(desc, "VPC Informational Server as of 03/10/2024");

        let desc = image_description(&entity("infosrv", &[]), &table, march_10());
        assert_eq!(desc, "Informational Server as of 03/10/2024");
    }

    #[test]
    fn description_falls_back_to_stack_then_unknown() {
        let table = BTreeMap::new();

        let stacked = entity("ec2-api", &[(CLOUDFORMATION_STACK_TAG, "api-prod")]);
        assert_eq!(
            image_description(&stacked, &table, march_10()),
            "EC2 api-prod as of 03/10/2024"
        );

        assert_eq!(
            image_description(&entity("worker", &[]), &table, march_10()),
            "Unknown as of 03/10/2024"
        );
    }

    #[test]
    fn snapshot_description_parsing() {
        assert_eq!(
            snapshot_image_id("Created by CreateImage(i-0abc1234) for ami-1234abcd from vol-99887766"),
            Some("ami-1234abcd")
        );
        assert_eq!(
            snapshot_image_id("Created by CreateImage(i-0abc1234def567890) for ami-0fedcba9876543210 from vol-0123456789abcdef0"),
            Some("ami-0fedcba9876543210")
        );
        assert_eq!(snapshot_image_id("manual snapshot"), None);
        assert_eq!(
            snapshot_image_id("Created by CreateImage(i-short) for ami-1234abcd from vol-99887766"),
            None
        );
        assert_eq!(
            snapshot_image_id("Created by CreateImage(i-0abc1234) for ami-ABCDEFGH from vol-99887766"),
            None
        );
    }
}
