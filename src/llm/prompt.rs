//! System prompt assembly.

use crate::conversation::models::UserProfile;
use crate::reply::Emotion;
use chrono::{DateTime, Utc};
use std::fmt::Write;

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    persona: String,
}

impl PromptBuilder {
    pub fn new(persona: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
        }
    }

    /// Persona, reply contract, current time and whatever is known about the user.
    pub fn build(&self, profile: Option<&UserProfile>, now: DateTime<Utc>) -> String {
        let emotions = Emotion::ALL
            .iter()
            .map(Emotion::as_str)
            .collect::<Vec<_>>()
            .join(", ");

        let mut prompt = String::new();
        let _ = writeln!(prompt, "{}", self.persona.trim());
        prompt.push('\n');
        let _ = writeln!(
            prompt,
            "Respond with exactly one JSON object and nothing else:\n\
             {{\"message\": \"<what you say>\", \"emotion\": \"<one of: {}>\", \
             \"task_completion\": {{\"task\": \"<task id or empty>\", \"completed\": \"<true|false or empty>\"}}}}",
            emotions
        );
        let _ = writeln!(
            prompt,
            "Only fill task_completion when the user says they finished or did not finish one of their tasks."
        );
        prompt.push('\n');
        let _ = writeln!(prompt, "Current time: {}", now.format("%A, %Y-%m-%d %H:%M UTC"));

        if let Some(profile) = profile {
            if let Some(name) = profile.first_name.as_deref().filter(|n| !n.trim().is_empty()) {
                let _ = writeln!(prompt, "You are talking to {}.", name.trim());
            }

            if profile.open_tasks.is_empty() {
                let _ = writeln!(prompt, "The user has no open tasks.");
            } else {
                let _ = writeln!(prompt, "Open tasks (id: title):");
                for task in &profile.open_tasks {
                    match task.due_at {
                        Some(due) => {
                            let _ = writeln!(
                                prompt,
                                "- {}: {} (due {})",
                                task.id,
                                task.title,
                                due.format("%Y-%m-%d %H:%M")
                            );
                        }
                        None => {
                            let _ = writeln!(prompt, "- {}: {}", task.id, task.title);
                        }
                    }
                }
            }

            if !profile.interests.is_empty() {
                let _ = writeln!(prompt, "Interests: {}", profile.interests.join(", "));
            }
        }

        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::models::TaskSummary;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()
    }

    /// The contract lists every emotion the validator accepts.
    #[test]
    fn test_prompt_lists_emotions() {
        let prompt = PromptBuilder::new("Be kind.").build(None, now());
        assert!(prompt.starts_with("Be kind."));
        for emotion in Emotion::ALL {
            assert!(prompt.contains(emotion.as_str()));
        }
        assert!(prompt.contains("2024-05-01 08:30 UTC"));
    }

    #[test]
    fn test_prompt_includes_profile() {
        let profile = UserProfile {
            first_name: Some("Mia".to_string()),
            open_tasks: vec![TaskSummary {
                id: 5,
                title: "Feed the cat".to_string(),
                due_at: None,
            }],
            interests: vec!["dinosaurs".to_string(), "space".to_string()],
        };
        let prompt = PromptBuilder::new("Be kind.").build(Some(&profile), now());

        assert!(prompt.contains("You are talking to Mia."));
        assert!(prompt.contains("- 5: Feed the cat"));
        assert!(prompt.contains("Interests: dinosaurs, space"));
    }

    #[test]
    fn test_prompt_without_tasks() {
        let prompt = PromptBuilder::new("Be kind.").build(Some(&UserProfile::default()), now());
        assert!(prompt.contains("no open tasks"));
    }
}
