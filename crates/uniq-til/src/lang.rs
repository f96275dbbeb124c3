//! The line-oriented scenario language.
//!
//! A set starts with a `Type: Blockchain` header; `//` starts a comment
//! (whole-line or trailing) and blank lines are skipped. Instructions:
//!
//! ```text
//! CreateAccountDeposit <name>: <amount>
//! Deposit <name>: <amount>
//! CreateVouch <from>-<to>
//! DeleteVouch <from>-<to>
//! Exit <name>: <amount>
//! > batch
//! > batchL1
//! > block
//! ```

use crate::TilError;

/// One parsed scenario instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// An L1 user tx creating an account for `user` with a deposit.
    CreateAccountDeposit {
        /// The scenario user the account belongs to.
        user: String,
        /// The deposited amount.
        amount: u64,
    },
    /// An L1 user tx depositing onto `user`'s existing account.
    Deposit {
        /// The scenario user receiving the deposit.
        user: String,
        /// The deposited amount.
        amount: u64,
    },
    /// An L2 tx creating the vouch edge `from → to`.
    CreateVouch {
        /// The vouching user.
        from: String,
        /// The vouched-for user.
        to: String,
    },
    /// An L2 tx deleting the vouch edge `from → to`.
    DeleteVouch {
        /// The vouching user.
        from: String,
        /// The vouched-for user.
        to: String,
    },
    /// An L2 exit of `amount` authored by `user`.
    Exit {
        /// The exiting user.
        user: String,
        /// The declared exit amount.
        amount: u64,
    },
    /// Close the current batch (L2 only).
    Batch,
    /// Close the current batch, forging the next L1 queue.
    BatchL1,
    /// Close the current block.
    Block,
}

/// Parses a scenario into `(line number, instruction)` pairs, checking
/// the `Type: Blockchain` header.
pub fn parse(source: &str) -> Result<Vec<(usize, Instruction)>, TilError> {
    let mut instructions = Vec::new();
    let mut saw_header = false;
    for (i, raw_line) in source.lines().enumerate() {
        let line = i + 1;
        let text = match raw_line.find("//") {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        };
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        if !saw_header {
            let mut tokens = text.split_whitespace();
            if tokens.next() != Some("Type:") || tokens.next() != Some("Blockchain") {
                return Err(TilError::MissingHeader { line });
            }
            if tokens.next().is_some() {
                return Err(TilError::MissingHeader { line });
            }
            saw_header = true;
            continue;
        }
        instructions.push((line, parse_instruction(line, text)?));
    }
    if !saw_header {
        return Err(TilError::MissingHeader { line: source.lines().count() });
    }
    Ok(instructions)
}

fn parse_instruction(line: usize, text: &str) -> Result<Instruction, TilError> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    match tokens.as_slice() {
        [">", "batch"] => Ok(Instruction::Batch),
        [">", "batchL1"] => Ok(Instruction::BatchL1),
        [">", "block"] => Ok(Instruction::Block),
        ["CreateAccountDeposit", user, amount] => {
            let (user, amount) = parse_funding(line, user, amount)?;
            Ok(Instruction::CreateAccountDeposit { user, amount })
        }
        ["Deposit", user, amount] => {
            let (user, amount) = parse_funding(line, user, amount)?;
            Ok(Instruction::Deposit { user, amount })
        }
        ["Exit", user, amount] => {
            let (user, amount) = parse_funding(line, user, amount)?;
            Ok(Instruction::Exit { user, amount })
        }
        ["CreateVouch", edge] => {
            let (from, to) = parse_edge(line, edge)?;
            Ok(Instruction::CreateVouch { from, to })
        }
        ["DeleteVouch", edge] => {
            let (from, to) = parse_edge(line, edge)?;
            Ok(Instruction::DeleteVouch { from, to })
        }
        _ => Err(TilError::UnknownInstruction {
            line,
            instruction: text.to_string(),
        }),
    }
}

fn parse_funding(line: usize, user: &str, amount: &str) -> Result<(String, u64), TilError> {
    let Some(name) = user.strip_suffix(':') else {
        return Err(TilError::Malformed {
            line,
            reason: format!("expected '<name>:', got {user:?}"),
        });
    };
    if name.is_empty() {
        return Err(TilError::Malformed {
            line,
            reason: "empty user name".to_string(),
        });
    }
    let amount = amount.parse::<u64>().map_err(|e| TilError::Malformed {
        line,
        reason: format!("bad amount {amount:?}: {e}"),
    })?;
    Ok((name.to_string(), amount))
}

fn parse_edge(line: usize, edge: &str) -> Result<(String, String), TilError> {
    match edge.split_once('-') {
        Some((from, to)) if !from.is_empty() && !to.is_empty() => {
            Ok((from.to_string(), to.to_string()))
        }
        _ => Err(TilError::Malformed {
            line,
            reason: format!("expected '<from>-<to>', got {edge:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_set_with_comments() {
        let set = "
            Type: Blockchain

            // fund two users
            CreateAccountDeposit A: 11
            Deposit B: 6

            CreateVouch A-B
            DeleteVouch A-B
            Exit A: 5

            > batchL1 // batchNum = 1
            > batch
            > block
        ";
        let parsed = parse(set).unwrap();
        let instructions: Vec<Instruction> =
            parsed.into_iter().map(|(_, instr)| instr).collect();
        assert_eq!(
            instructions,
            vec![
                Instruction::CreateAccountDeposit {
                    user: "A".to_string(),
                    amount: 11
                },
                Instruction::Deposit {
                    user: "B".to_string(),
                    amount: 6
                },
                Instruction::CreateVouch {
                    from: "A".to_string(),
                    to: "B".to_string()
                },
                Instruction::DeleteVouch {
                    from: "A".to_string(),
                    to: "B".to_string()
                },
                Instruction::Exit {
                    user: "A".to_string(),
                    amount: 5
                },
                Instruction::BatchL1,
                Instruction::Batch,
                Instruction::Block,
            ]
        );
    }

    #[test]
    fn header_is_mandatory() {
        assert!(matches!(
            parse("CreateAccountDeposit A: 1"),
            Err(TilError::MissingHeader { .. })
        ));
        assert!(matches!(
            parse("Type: Backwards\n> block"),
            Err(TilError::MissingHeader { .. })
        ));
        assert!(matches!(
            parse("// only comments\n"),
            Err(TilError::MissingHeader { .. })
        ));
    }

    #[test]
    fn rejects_malformed_instructions() {
        let parse_one = |body: &str| parse(&format!("Type: Blockchain\n{body}"));
        assert!(matches!(
            parse_one("Transfer A-B: 5"),
            Err(TilError::UnknownInstruction { line: 2, .. })
        ));
        assert!(matches!(
            parse_one("Deposit A 5"),
            Err(TilError::Malformed { .. })
        ));
        assert!(matches!(
            parse_one("Deposit A: lots"),
            Err(TilError::Malformed { .. })
        ));
        assert!(matches!(
            parse_one("CreateVouch AB"),
            Err(TilError::Malformed { .. })
        ));
        assert!(matches!(
            parse_one("> blockL1"),
            Err(TilError::UnknownInstruction { .. })
        ));
    }
}
