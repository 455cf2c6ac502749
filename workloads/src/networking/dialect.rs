/*
 * Copyright (c) Huawei Technologies Co., Ltd. 2024. All rights reserved.
 * KubeOS is licensed under the Mulan PSL v2.
 * You can use this software according to the terms and conditions of the Mulan PSL v2.
 * You may obtain a copy of Mulan PSL v2 at:
 *     http://license.coscl.org.cn/MulanPSL2
 * THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND, EITHER EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR
 * PURPOSE.
 * See the Mulan PSL v2 for more details.
 */

//! Path rewriting rules of the nginx ingress controller. Controllers up to
//! 0.21 rewrite plain prefixes; from 0.22 on the location is a regex and
//! the rewrite target refers to its capture groups.

use lazy_static::lazy_static;
use regex::Regex;

pub const REGEX_DIALECT_SINCE: (u32, u32) = (0, 22);

pub trait IngressDialect: Send + Sync {
    fn name(&self) -> &'static str;
    fn make_location_path(&self, path: &str) -> String;
    fn parse_location_path(&self, location: &str) -> String;
    fn make_rewrite_target(&self) -> String;
    /// `fallback_script_name` is used when the location itself is the root path.
    fn configuration_snippet(&self, path: &str, fallback_script_name: Option<&str>) -> String;
    fn uses_regex(&self) -> bool;
}

pub struct LegacyDialect;

pub struct RegexDialect {
    /// Also match the prefix without its trailing slash.
    pub match_bare_prefix: bool,
}

impl IngressDialect for LegacyDialect {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn make_location_path(&self, path: &str) -> String {
        path.to_string()
    }

    fn parse_location_path(&self, location: &str) -> String {
        location.to_string()
    }

    fn make_rewrite_target(&self) -> String {
        "/".to_string()
    }

    fn configuration_snippet(&self, path: &str, fallback_script_name: Option<&str>) -> String {
        match fallback_script_name {
            Some(script_name) if path == "/" => format!("proxy_set_header X-Script-Name {};", script_name.trim_end_matches('/')),
            _ => "proxy_set_header X-Script-Name $location_path;".to_string(),
        }
    }

    fn uses_regex(&self) -> bool {
        false
    }
}

lazy_static! {
    static ref TRAILING_EMPTY_GROUP: Option<Regex> = Regex::new(r"^/\((?P<prefix>.+)\)/\(\.\*\)\(\)$").ok();
    static ref BARE_PREFIX_GROUP: Option<Regex> =
        Regex::new(r"^/\((?P<prefix>.+)\)/\(\.\*\)\|/\((?P<bare>.+)\$\)$").ok();
}

fn captured_prefix(re: &Option<Regex>, location: &str) -> Option<String> {
    re.as_ref().and_then(|re| re.captures(location)).and_then(|caps| caps.name("prefix")).map(|m| m.as_str().to_string())
}

impl IngressDialect for RegexDialect {
    fn name(&self) -> &'static str {
        "regex"
    }

    fn make_location_path(&self, path: &str) -> String {
        let prefix = path.trim_start_matches('/').trim_end_matches('/');
        if prefix.is_empty() {
            return "/()(.*)".to_string();
        }
        if self.match_bare_prefix {
            format!("/({})/(.*)|/({}$)", prefix, prefix)
        } else {
            format!("/({})/(.*)()", prefix)
        }
    }

    fn parse_location_path(&self, location: &str) -> String {
        if location == "/()(.*)" {
            return "/".to_string();
        }
        captured_prefix(&TRAILING_EMPTY_GROUP, location)
            .or_else(|| captured_prefix(&BARE_PREFIX_GROUP, location))
            .map(|prefix| format!("/{}/", prefix))
            .unwrap_or_else(|| location.to_string())
    }

    fn make_rewrite_target(&self) -> String {
        "/$2".to_string()
    }

    fn configuration_snippet(&self, _path: &str, _fallback_script_name: Option<&str>) -> String {
        "proxy_set_header X-Script-Name /$1$3;".to_string()
    }

    fn uses_regex(&self) -> bool {
        true
    }
}

fn parse_version(version: &str) -> (u32, u32) {
    let mut parts = version.trim_start_matches('v').split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    (parts.next().unwrap_or(0), parts.next().unwrap_or(0))
}

/// Picks the dialect matching the cluster's ingress controller version.
pub fn dialect_for(controller_version: &str) -> Box<dyn IngressDialect> {
    if parse_version(controller_version) >= REGEX_DIALECT_SINCE {
        Box::new(RegexDialect { match_bare_prefix: false })
    } else {
        Box::new(LegacyDialect)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_regex_location_paths() {
        let dialect = RegexDialect { match_bare_prefix: false };
        assert_eq!(dialect.make_location_path("/sub/"), "/(sub)/(.*)()");
        assert_eq!(dialect.parse_location_path("/(sub)/(.*)()"), "/sub/");
        assert_eq!(dialect.make_location_path("/"), "/()(.*)");
        assert_eq!(dialect.parse_location_path("/()(.*)"), "/");
        assert_eq!(dialect.make_rewrite_target(), "/$2");
        assert_eq!(dialect.configuration_snippet("/sub/", None), "proxy_set_header X-Script-Name /$1$3;");
    }

    #[test]
    fn test_location_paths_round_trip() {
        let dialects: Vec<Box<dyn IngressDialect>> = vec![
            Box::new(LegacyDialect),
            Box::new(RegexDialect { match_bare_prefix: false }),
            Box::new(RegexDialect { match_bare_prefix: true }),
        ];
        for dialect in &dialects {
            for path in ["/", "/sub/", "/stag--api--foo/", "/a/b/", "/ieod-bkapp-foo-stag/"] {
                assert_eq!(dialect.parse_location_path(&dialect.make_location_path(path)), path, "{}", dialect.name());
            }
        }
        let bare = RegexDialect { match_bare_prefix: true };
        assert_eq!(bare.make_location_path("/sub/"), "/(sub)/(.*)|/(sub$)");
    }

    #[test]
    fn test_dialect_selection() {
        assert_eq!(dialect_for("0.21.0").name(), "legacy");
        assert_eq!(dialect_for("0.22.0").name(), "regex");
        assert_eq!(dialect_for("v1.2.1").name(), "regex");
        let legacy = dialect_for("0.20");
        assert_eq!(legacy.make_rewrite_target(), "/");
        assert_eq!(legacy.configuration_snippet("/", Some("/stag--foo/")), "proxy_set_header X-Script-Name /stag--foo;");
        assert_eq!(legacy.configuration_snippet("/foo/", Some("/stag--foo/")), "proxy_set_header X-Script-Name $location_path;");
    }
}
