//! Classifier prompt construction.
//!
//! The system prompt carries the topic lists and the output contract; the
//! user message is a compact JSON rendering of the batch. Body text is
//! passed as-is; batch sizing is the batcher's job, not the prompt's.

use crate::config::Config;
use crate::types::EmailThread;

/// Build the system prompt from the user's topic configuration.
pub fn system_prompt(config: &Config) -> String {
    let mut out = String::new();
    out.push_str(
        "You are an email triage assistant. You receive a JSON array of email \
         threads and sort individual emails into two buckets:\n\
         - \"mustDo\": emails that require an action from the user\n\
         - \"mustKnow\": emails with information the user needs to be aware of\n\n",
    );

    out.push_str("Must-do topics:\n");
    push_topic_list(&mut out, &config.must_do_topic_list(), config.must_do_other);

    out.push_str("\nMust-know topics:\n");
    push_topic_list(
        &mut out,
        &config.must_know_topic_list(),
        config.must_know_other,
    );

    out.push_str(
        "\nRespond with ONLY a JSON object of the form:\n\
         {\"mustDo\": [{\"emailId\", \"rfc822Id\", \"subject\", \"sender\", \
         \"topic\", \"keyAction\"}], \
         \"mustKnow\": [{\"emailId\", \"rfc822Id\", \"subject\", \"sender\", \
         \"topic\", \"keyKnowledge\"}]}\n\
         Copy emailId, rfc822Id, subject and sender verbatim from the input. \
         keyAction is the single concrete action the email asks for; \
         keyKnowledge is a one-sentence summary of what matters. \
         Emails matching no topic are omitted entirely. Both arrays may be \
         empty.\n",
    );
    out
}

fn push_topic_list(out: &mut String, topics: &[String], allow_other: bool) {
    if topics.is_empty() && !allow_other {
        out.push_str("- (none configured; leave this bucket empty)\n");
        return;
    }
    for topic in topics {
        out.push_str("- ");
        out.push_str(topic);
        out.push('\n');
    }
    if allow_other {
        out.push_str(
            "- other: anything else you judge clearly important; use topic \"other\"\n",
        );
    }
}

/// Render the batch as the user message payload.
pub fn batch_payload(threads: &[&EmailThread]) -> String {
    let items: Vec<serde_json::Value> = threads
        .iter()
        .map(|t| {
            serde_json::json!({
                "threadId": t.thread_id,
                "subject": t.subject,
                "emails": t.emails.iter().map(|m| {
                    serde_json::json!({
                        "emailId": m.id,
                        "rfc822Id": m.rfc822_id,
                        "sender": m.sender,
                        "subject": m.subject,
                        "date": m.date.to_rfc3339(),
                        "body": m.body,
                    })
                }).collect::<Vec<_>>(),
            })
        })
        .collect();
    serde_json::to_string(&items).expect("batch payload serializes")
}
