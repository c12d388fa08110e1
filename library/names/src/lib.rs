use convert_case::{Case, Casing};

const DEFAULT_IF_INVALID_PREFIX: &str = "invalid-queue-name";

/// The hard ceiling that Kubernetes places on object names that must double as
/// DNS labels. Please see [RFC 1123](https://datatracker.ietf.org/doc/html/rfc1123#section-6.1.3.5)
/// and Kubernetes' own [validation.go](https://github.com/kubernetes/kubernetes/blob/f3b98a08b05257fbc3c19b52ced70ea67c546b1e/staging/src/k8s.io/apimachinery/pkg/util/validation/validation.go#L135).
///
/// Specifically, failure to comply results in the following error message from
/// the API server.
///
/// ```text
/// a DNS-1035 label must consist of lower case alphanumeric characters or '-', start with an alphabetic character, and end with an alphanumeric character (e.g. 'my-name',  or 'abc-123', regex used for validation is '[a-z]([-a-z0-9]*[a-z0-9])?'
/// ```
const MAX_LABEL: usize = 63;

/// pod_name derives the deterministic cluster name of a single pod of a job.
///
/// Determinism matters here. The submitted-pods cache is keyed by job id and is
/// reconciled against informer observations; if the same (queue, job id, pod
/// number) triple could produce two different pod names then a re-submission
/// racing an informer could leave duplicate pods behind. The same triple MUST
/// always map to the same name.
///
/// Normalization:
/// * 1. The queue name has all non-alphanumeric characters converted to spaces
///      and is then lowercased into a kebab: "Team Alpha/GPU" becomes
///      "team-alpha-gpu". An empty result falls back to "invalid-queue-name".
/// * 2. The job id is lowercased verbatim (job ids are ULID-like and already
///      alphanumeric; anything else would have been rejected upstream).
/// * 3. The result is "{queue}-{job_id}-{pod_number}".
/// * 4. If the result exceeds 63 bytes the QUEUE prefix is truncated, never
///      the job id nor the pod number, because those two are what operators
///      grep for.
pub fn pod_name<Q: AsRef<str>, J: AsRef<str>>(queue: Q, job_id: J, pod_number: u32) -> String {
    let job_id = job_id.as_ref().to_lowercase();
    let suffix = format!("-{}-{}", job_id, pod_number);
    let mut prefix = sanitize_label(queue);
    if prefix.len() + suffix.len() > MAX_LABEL {
        prefix.truncate(MAX_LABEL.saturating_sub(suffix.len()));
        // Truncation may have left a trailing hyphen behind.
        while prefix.ends_with('-') {
            prefix.pop();
        }
    }
    let name = if prefix.is_empty() {
        suffix[1..].to_string()
    } else {
        format!("{}{}", prefix, suffix)
    };
    debug_assert!(name.len() <= MAX_LABEL);
    name
}

/// sanitize_label normalizes arbitrary operator supplied text (most commonly a
/// queue name) into something the Kubernetes API server will accept as a label
/// value or a name fragment. All non-alphanumeric characters become word
/// boundaries and the result is a lowercase kebab.
pub fn sanitize_label<T: AsRef<str>>(input: T) -> String {
    let label = input
        .as_ref()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_case(Case::Kebab);
    if label.is_empty() {
        DEFAULT_IF_INVALID_PREFIX.to_string()
    } else {
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{thread_rng, Rng};
    use regex::Regex;

    #[test]
    fn deterministic() {
        let a = pod_name("gpu-jobs", "01ARZ3NDEKTSV4RRFFQ69G5FAV", 0);
        let b = pod_name("gpu-jobs", "01ARZ3NDEKTSV4RRFFQ69G5FAV", 0);
        assert_eq!(a, b);
        assert_eq!("gpu-jobs-01arz3ndektsv4rrffq69g5fav-0", a);
    }

    #[test]
    fn complex_queue_name() {
        let name = pod_name("Team Alpha/GPU (big)", "01arz3ndektsv4rrffq69g5fav", 3);
        assert!(name.starts_with("team-alpha-gpu-big-"));
        assert!(name.ends_with("-01arz3ndektsv4rrffq69g5fav-3"));
    }

    #[test]
    fn empty_queue_name() {
        let name = pod_name("", "01arz3ndektsv4rrffq69g5fav", 0);
        assert!(name.starts_with("invalid-queue-name-"));
    }

    #[test]
    fn emoji_queue_name() {
        let name = pod_name("🤮🤮🤮", "01arz3ndektsv4rrffq69g5fav", 0);
        assert!(name.starts_with("invalid-queue-name-"));
    }

    #[test]
    fn long_queue_name_truncates_the_queue_not_the_job() {
        let queue = "a".repeat(200);
        let name = pod_name(&queue, "01arz3ndektsv4rrffq69g5fav", 12);
        assert!(name.len() <= 63);
        assert!(name.ends_with("-01arz3ndektsv4rrffq69g5fav-12"));
    }

    #[test]
    fn fuzz_rfc1123() {
        let r = Regex::new("^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap();
        let mut rng = thread_rng();
        for _ in 0..10000 {
            let length = rng.gen_range(0..200);
            let queue: String = (0..length).map(|_| rng.gen_range(' '..='~')).collect();
            let got = pod_name(queue, "01arz3ndektsv4rrffq69g5fav", rng.gen_range(0..1000));
            assert!(got.len() <= 63);
            assert!(r.is_match(got.as_str()), "{}", got);
        }
    }
}
