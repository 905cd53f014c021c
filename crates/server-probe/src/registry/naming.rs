// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Display name de-duplication for imported favorites.

/// Split `"Name (N)"` into `("Name", N)`. Names without a numeric tag get a
/// tag of 1.
#[must_use]
pub fn split_tag(name: &str) -> (&str, u32) {
    let untagged = (name.trim(), 1);

    let Some(inner) = name.trim_end().strip_suffix(')') else {
        return untagged;
    };
    let Some(open) = inner.rfind('(') else {
        return untagged;
    };

    let base = inner[..open].trim();
    let digits = &inner[open + 1..];
    if base.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return untagged;
    }

    match digits.parse() {
        Ok(tag) => (base, tag),
        Err(_overflow) => untagged,
    }
}

/// First free name derived from `proposed`, trying `base` for tag 1 and
/// `base (tag)` for higher tags, counting up.
pub fn unique_name(proposed: &str, taken: impl Fn(&str) -> bool) -> String {
    let (base, mut tag) = split_tag(proposed);

    loop {
        let candidate = if tag <= 1 {
            base.to_string()
        } else {
            format!("{base} ({tag})")
        };
        if !taken(&candidate) {
            return candidate;
        }
        tag = tag.saturating_add(1);
    }
}
