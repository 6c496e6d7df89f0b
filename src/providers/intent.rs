//! Intent mode selection
//!
//! Decides which LLM entry point a turn uses: `function_call` advertises the
//! dispatcher's functions, `nointent` keeps turns as plain chat.

use super::{Intent, IntentMode};

pub struct ConfiguredIntent {
    mode: IntentMode,
}

impl ConfiguredIntent {
    pub fn from_name(name: &str) -> Self {
        let mode = match name {
            "function_call" => IntentMode::FunctionCall,
            _ => IntentMode::NoIntent,
        };
        Self { mode }
    }
}

impl Intent for ConfiguredIntent {
    fn mode(&self) -> IntentMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_mapping() {
        assert_eq!(
            ConfiguredIntent::from_name("function_call").mode(),
            IntentMode::FunctionCall
        );
        assert_eq!(
            ConfiguredIntent::from_name("nointent").mode(),
            IntentMode::NoIntent
        );
        assert_eq!(
            ConfiguredIntent::from_name("anything_else").mode(),
            IntentMode::NoIntent
        );
    }
}
