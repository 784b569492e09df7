use clap::Parser;

use crate::{AlertTargets, Cli};

#[test]
fn telegram_target_needs_token_and_chat() {
    // Arrange
    let both = ["pingwatchd", "--telegram-bot-token", "123:abc", "--telegram-chat-id", "42", "status"];
    let token_only = ["pingwatchd", "--telegram-bot-token", "123:abc", "status"];

    // Act
    let cli = Cli::try_parse_from(both).expect("parse");
    let rejected = Cli::try_parse_from(token_only);

    // Assert
    let targets = AlertTargets::from_cli(&cli);
    assert_eq!(targets.telegram, Some(("123:abc".to_string(), "42".to_string())));
    assert_eq!(targets.webhook_url, None);
    assert!(rejected.is_err(), "a token without a chat id should be refused");
}
