//! Counts the occurrences of every word in the input.

use anyhow::Result;

use common::{KeyValue, MapOutput};

/// Emits `(word, "1")` for every run of alphabetic characters.
pub fn map(kv: KeyValue) -> MapOutput {
    let words: Vec<String> = kv
        .value
        .split(|c: char| !c.is_alphabetic())
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect();

    let iter = words
        .into_iter()
        .map(|word| Ok::<_, anyhow::Error>(KeyValue::new(word, "1")));
    Ok(Box::new(iter))
}

pub fn reduce(_key: &str, values: &[String]) -> Result<String> {
    let mut count = 0u64;

    for value in values {
        count += value.parse::<u64>()?;
    }

    Ok(count.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_non_letters() {
        let kv = KeyValue::new("doc.txt", "It's a dog-eat-dog world, 2 dogs.");
        let words: Vec<_> = map(kv).unwrap().map(|kv| kv.unwrap().key).collect();

        assert_eq!(words, ["It", "s", "a", "dog", "eat", "dog", "world", "dogs"]);
    }

    #[test]
    fn sums_counts() {
        let values = vec!["1".to_string(), "1".to_string(), "3".to_string()];
        assert_eq!(reduce("dog", &values).unwrap(), "5");
        assert!(reduce("dog", &["one".to_string()]).is_err());
    }
}
