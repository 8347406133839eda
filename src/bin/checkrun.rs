//! In-sandbox driver binary. Staged into every jail work directory and
//! executed there; see `gradewatch::checker` for the wire contract.

fn main() {
    gradewatch::checker::driver::main();
}
