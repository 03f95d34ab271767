//! Read a forest from a plain-text mesh file and export it to VTK.
//!
//! Rank 0 writes the three-tree L-shape mesh to a temporary file and
//! broadcasts the file name; every rank then reads the connectivity, builds
//! a forest with a per-leaf payload recording the owning tree, and writes
//! the local leaves to `mesh.vtk`.

use quadforest::comm::Communicator;
use quadforest::tree::InitFn;
use quadforest::{vtk, Connectivity, DummyComm, Forest};

fn main() {
    env_logger::init();

    let comm = DummyComm::new();

    let mut path_bytes: Vec<u8> = if comm.rank() == 0 {
        let path = std::env::temp_dir().join("quadforest_lshape.mesh");
        std::fs::write(&path, include_str!("lshape.mesh")).unwrap();
        path.to_str().unwrap().as_bytes().to_vec()
    } else {
        Vec::new()
    };
    comm.broadcast_vec(0, &mut path_bytes);
    let path = String::from_utf8(path_bytes).unwrap();

    let connectivity = if comm.rank() == 0 {
        Some(Connectivity::read(&path).unwrap())
    } else {
        None
    };
    let connectivity = Connectivity::broadcast(&comm, 0, connectivity);
    if comm.rank() == 0 {
        print!("{}", connectivity);
    }

    // four bytes of per-leaf data recording the owning tree
    let init: &InitFn = &|which_tree, _, bytes: &mut [u8]| {
        bytes.copy_from_slice(&(which_tree as u32).to_le_bytes());
    };
    let forest = Forest::new(&comm, &connectivity, 4, Some(init));
    assert!(forest.is_valid());
    println!(
        "forest with {} quadrants on rank {} of {}",
        forest.global_num_quadrants,
        comm.rank(),
        comm.size()
    );

    vtk::write_forest(&forest, "mesh.vtk");

    comm.barrier();
    if comm.rank() == 0 {
        std::fs::remove_file(&path).unwrap();
    }
}
