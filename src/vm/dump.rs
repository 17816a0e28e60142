//! Human readable listing of a [`Module`].

use std::fmt::Write;

use super::bytecode::{DataItem, Function, Module};

/// Render `module` as a text listing.
pub fn disassemble(module: &Module) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "ops:");
    for (index, name) in module.ops.iter().enumerate() {
        let _ = writeln!(out, "  {:>4} {}", index, name);
    }

    let _ = writeln!(out, "globals: {} bytes", module.globals_size);

    let _ = writeln!(out, "data: {} bytes", module.data_size());
    let mut offset = 0;
    for item in &module.data {
        let _ = writeln!(out, "  {:04} {}", offset, format_data_item(item));
        offset += item.size();
    }

    for (index, func) in module.functions.iter().enumerate() {
        out.push('\n');
        write_function(&mut out, index, func);
    }

    out
}

/// Render `module` as pretty-printed JSON.
pub fn to_json(module: &Module) -> serde_json::Result<String> {
    serde_json::to_string_pretty(module)
}

fn write_function(out: &mut String, index: usize, func: &Function) {
    let _ = write!(out, "fn {} {}", index, func.name);
    if func.export {
        let _ = write!(out, " (export)");
    }
    let result = func
        .result
        .map_or_else(|| "-".to_string(), |size| size.to_string());
    let _ = writeln!(
        out,
        " params={:?} result={} locals={:?}",
        func.params, result, func.locals
    );

    for (pc, instruction) in func.code.iter().enumerate() {
        for (label, _) in func.labels.iter().filter(|(_, at)| *at as usize == pc) {
            let _ = writeln!(out, "  {}:", label);
        }
        let _ = writeln!(out, "  {:04} {}", pc, instruction);
    }
    for (label, _) in func
        .labels
        .iter()
        .filter(|(_, at)| *at as usize == func.code.len())
    {
        let _ = writeln!(out, "  {}:", label);
    }
}

fn format_data_item(item: &DataItem) -> String {
    match item {
        DataItem::I8(v) => format!("i8 {}", v),
        DataItem::U8(v) => format!("u8 {}", v),
        DataItem::I16(v) => format!("i16 {}", v),
        DataItem::U16(v) => format!("u16 {}", v),
        DataItem::I32(v) => format!("i32 {}", v),
        DataItem::U32(v) => format!("u32 {}", v),
        DataItem::I64(v) => format!("i64 {}", v),
        DataItem::U64(v) => format!("u64 {}", v),
        DataItem::F32(v) => format!("f32 {}", v),
        DataItem::F64(v) => format!("f64 {}", v),
        DataItem::Bool(v) => format!("bool {}", v),
        DataItem::Bytes(bytes) => format!("bytes [{}]", hex(bytes)),
        DataItem::Str(text) => format!("str {:?}", text),
    }
}

/// Space separated lowercase hex.
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ops::Instruction;

    #[test]
    fn test_disassemble() {
        let mut module = Module::new().with_globals(8);
        let op = module.op("print");
        module.data(DataItem::Str("hi".to_string()));
        module.function(
            Function::new("main")
                .exported()
                .label("top")
                .emit(Instruction::OpBegin)
                .emit(Instruction::DataAddress(0))
                .emit(Instruction::Param)
                .emit(Instruction::OpEnd { op, result: 0 })
                .label("end"),
        );

        let text = disassemble(&module);
        assert!(text.contains("     0 print"));
        assert!(text.contains("globals: 8 bytes"));
        assert!(text.contains("0000 str \"hi\""));
        assert!(text.contains("fn 0 main (export) params=[] result=- locals=[]"));
        assert!(text.contains("  top:\n  0000 op_begin"));
        assert!(text.contains("0003 op_end 0 result=0\n  end:"));
    }

    #[test]
    fn test_json() {
        let mut module = Module::new();
        module.function(Function::new("main").emit(Instruction::Return));
        let json = to_json(&module).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["functions"][0]["name"], "main");
        assert_eq!(value["functions"][0]["code"][0]["op"], "return");
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x00, 0xab, 0x10]), "00 ab 10");
        assert_eq!(hex(&[]), "");
    }
}
