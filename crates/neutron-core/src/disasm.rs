//! disasm.rs — Désassembleur lisible pour les chunks Neutron.
//!
//! Sort un listing du style :
//!
//! ```text
//! == <script> ==
//! 0000  (line    1)  const     0   /* "hello" */
//! 0002  (line    1)  say
//! 0003  (line    1)  nil
//! 0004  (line    1)  ret
//! ```
//!
//! Les index de constantes sont résolus et affichés en commentaire ;
//! les sauts affichent leur destination absolue.

use std::fmt::Write as _;

use crate::chunk::{Chunk, Constant};
use crate::ops::{OpCode, TRY_NONE};
use crate::types::TypeTag;

/// Désassemble un chunk complet sous un titre.
pub fn disassemble(chunk: &Chunk, title: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "== {title} ==");
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_at(chunk, offset, &mut out);
    }
    // Les protos imbriquées à la suite, comme des sections.
    for konst in &chunk.constants {
        match konst {
            Constant::Function(proto) => {
                out.push('\n');
                out.push_str(&disassemble(&proto.chunk, &format!("fn {}", proto.name)));
            }
            Constant::Class(class) => {
                for (name, proto) in &class.methods {
                    out.push('\n');
                    out.push_str(&disassemble(
                        &proto.chunk,
                        &format!("{}.{}", class.name, name),
                    ));
                }
            }
            _ => {}
        }
    }
    out
}

/// Désassemble l'instruction à `offset`, retourne l'offset suivant.
pub fn disassemble_at(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let line = chunk.line_for(offset);
    let _ = write!(out, "{offset:04}  (line {line:>4})  ");

    let Some(op) = OpCode::from_byte(chunk.code[offset]) else {
        let _ = writeln!(out, "?? 0x{:02x}", chunk.code[offset]);
        return offset + 1;
    };

    use OpCode::*;
    let next = match op {
        Constant | GetGlobal | SetGlobal | DefineGlobal | SetGlobalTyped | GetProperty
        | SetProperty | Closure | UseModule | UsingFile => {
            let idx = chunk.code[offset + 1];
            let _ = write!(out, "{:<9} {idx:3}", op.mnemonic());
            if let Some(k) = chunk.constant(idx) {
                let _ = write!(out, "   /* {k} */");
            }
            let _ = writeln!(out);
            offset + 2
        }
        GetLocal | SetLocal | Call | Array | Object => {
            let _ = writeln!(out, "{:<9} {:3}", op.mnemonic(), chunk.code[offset + 1]);
            offset + 2
        }
        DefineTypedGlobal => {
            let idx = chunk.code[offset + 1];
            let tag = TypeTag::from_byte(chunk.code[offset + 2]);
            let _ = write!(out, "{:<9} {idx:3} : {}", op.mnemonic(), tag_name(tag));
            if let Some(k) = chunk.constant(idx) {
                let _ = write!(out, "   /* {k} */");
            }
            let _ = writeln!(out);
            offset + 3
        }
        SetLocalTyped => {
            let slot = chunk.code[offset + 1];
            let tag = TypeTag::from_byte(chunk.code[offset + 2]);
            let _ = writeln!(out, "{:<9} {slot:3} : {}", op.mnemonic(), tag_name(tag));
            offset + 3
        }
        Jump | JumpIfFalse => {
            let delta = read_u16(chunk, offset + 1);
            let dest = offset + 3 + delta as usize;
            let _ = writeln!(out, "{:<9} -> {dest:04}", op.mnemonic());
            offset + 3
        }
        Loop => {
            let delta = read_u16(chunk, offset + 1);
            let dest = (offset + 3).saturating_sub(delta as usize);
            let _ = writeln!(out, "{:<9} -> {dest:04}", op.mnemonic());
            offset + 3
        }
        Try => {
            let try_end = read_u16(chunk, offset + 1);
            let catch = read_u16(chunk, offset + 3);
            let finally = read_u16(chunk, offset + 5);
            let _ = writeln!(
                out,
                "{:<9} end={try_end:04} catch={} finally={}",
                op.mnemonic(),
                fmt_try_target(catch),
                fmt_try_target(finally),
            );
            offset + 7
        }
        _ => {
            let _ = writeln!(out, "{}", op.mnemonic());
            offset + 1
        }
    };
    next
}

#[inline]
fn read_u16(chunk: &Chunk, at: usize) -> u16 {
    ((chunk.code[at] as u16) << 8) | chunk.code[at + 1] as u16
}

fn fmt_try_target(v: u16) -> String {
    if v == TRY_NONE {
        "-".to_string()
    } else {
        format!("{v:04}")
    }
}

fn tag_name(tag: Option<TypeTag>) -> &'static str {
    tag.map(TypeTag::display_name).unwrap_or("?")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Constant;

    #[test]
    fn listing_resolves_constants_and_jumps() {
        let mut c = Chunk::new();
        let k = c.add_constant(Constant::Str("hi".into())).unwrap();
        c.write_op(OpCode::Constant, 1);
        c.write_byte(k, 1);
        c.write_op(OpCode::JumpIfFalse, 1);
        c.write_u16(1, 1);
        c.write_op(OpCode::Say, 2);
        c.write_op(OpCode::Return, 2);

        let text = disassemble(&c, "<script>");
        assert!(text.contains("== <script> =="));
        assert!(text.contains("\"hi\""));
        assert!(text.contains("jz        -> 0006"));
        assert!(text.contains("ret"));
    }

    #[test]
    fn try_operands_show_sentinels() {
        let mut c = Chunk::new();
        c.write_op(OpCode::Try, 1);
        c.write_u16(12, 1);
        c.write_u16(TRY_NONE, 1);
        c.write_u16(14, 1);
        c.write_op(OpCode::Return, 1);
        let text = disassemble(&c, "t");
        assert!(text.contains("catch=-"));
        assert!(text.contains("finally=0014"));
    }
}
