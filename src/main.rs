// mirvm: a tree-walking interpreter for a typed mid-level IR.
//
// Copyright (C) 2019  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

use std::env::args;
use std::process::exit;

use mirvm::mir;
use mirvm::trace::{JsonTracer, NullTracer, Tracer};
use mirvm::vm::Vm;

fn main() {
    env_logger::init();

    let path = args().nth(1).expect("usage: mirvm <image.ron> [--trace]");
    let image = mir::load(&path).expect("couldn't load image");

    let tracer: Box<dyn Tracer> = if args().any(|a| a == "--trace") {
        Box::new(JsonTracer::new(std::io::stderr()))
    } else {
        Box::new(NullTracer)
    };

    let mut vm = Vm::new(&image.module, &image.types, tracer);
    match vm.run("main", Vec::new()) {
        Ok(v) => println!("{:?}", v),
        Err(p) => {
            eprintln!("panic: {:?}: {} at {:?}", p.kind, p.message, p.span);
            exit(1);
        }
    }
}
