//! CUDA C kernel source for runtime compilation via NVRTC.

/// Tile rows per output tile; must match `TM` in [`KERNEL_SOURCE`].
pub const TILE_M: usize = 32;
/// Tile columns per output tile; must match `TN`.
pub const TILE_N: usize = 32;
/// Reduction-dimension step; must match `TK`.
pub const TILE_K: usize = 16;
/// Threads per block; must match `THREADS`.
pub const THREADS: u32 = 256;

/// Static `__shared__` bytes of `fused_l2_nn`: the padded main-loop and
/// epilogue union plus `rownorm_store`, `reduced_val` and `reduced_key`.
pub const FUSED_SHARED_MEM_BYTES: usize = {
    let main_loop = TILE_M * (TILE_K + 1) + TILE_K * (TILE_N + 1);
    let epilogue = TILE_M * (TILE_N + 1);
    let union = if main_loop > epilogue { main_loop } else { epilogue };
    (union + 3 * TILE_M) * 4
};

/// Combined CUDA kernel source for all GPU operations.
pub const KERNEL_SOURCE: &str = r#"
#define TM 32
#define TN 32
#define TK 16
#define THREADS 256
#define ROWS_PER_THREAD (TM * TN / THREADS)
#define THREAD_ROWS (THREADS / TN)
#define MAX_DISTANCE 3.402823466e+38f

extern "C" {

// ── Row norms ──────────────────────────────────────────────────────
// One thread per row, double accumulation.

__global__ void row_norms(
    const float* data,
    float* out,
    int rows,
    int cols
) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= rows) return;
    double sum = 0.0;
    for (int c = 0; c < cols; c++) {
        double v = (double)data[(long long)i * cols + c];
        sum += v * v;
    }
    out[i] = (float)sum;
}

// ── Fused L2 nearest neighbour ─────────────────────────────────────
// Persistent kernel: block b sweeps tiles [b*chunk, (b+1)*chunk) of the
// row-major tile grid. Main-loop and epilogue storage alias in a union;
// row norms and the running reduction live outside it. Row norms are staged
// with plain loads rather than cp.async; the main loop's barriers order them
// before the epilogue reads them.

struct MainLoopSmem {
    float a[TM][TK + 1];
    float b[TK][TN + 1];
};

struct EpilogueSmem {
    float dist[TM][TN + 1];
};

union KernelSmem {
    MainLoopSmem main_loop;
    EpilogueSmem epilogue;
};

__device__ __forceinline__ bool prefers(int a, int b, int highest) {
    if (a < 0) return false;
    if (b < 0) return true;
    return highest ? (a > b) : (a < b);
}

__global__ void __launch_bounds__(THREADS) fused_l2_nn(
    const float* x,          // M x K row-major
    const float* y,          // N x K row-major (B column-major, ld = K)
    const float* xn,
    const float* yn,
    int M,
    int N,
    int K,
    int sqrt_out,
    int highest_tie,
    float* out_val,          // M, complete rows
    int* out_key,
    float* edge_val,         // units x 2 x TM, partial rows
    int* edge_key,
    int* edge_band           // units x 2, -1 when unused
) {
    __shared__ KernelSmem smem;
    __shared__ float rownorm_store[TM];
    __shared__ float reduced_val[TM];
    __shared__ int reduced_key[TM];

    const int tid = threadIdx.x;
    const int tx = tid % TN;
    const int ty = tid / TN;

    const int grid_rows = (M + TM - 1) / TM;
    const int grid_cols = (N + TN - 1) / TN;
    const int tiles = grid_rows * grid_cols;
    const int chunk = (tiles + gridDim.x - 1) / gridDim.x;
    const int start = min((int)blockIdx.x * chunk, tiles);
    const int end = min(start + chunk, tiles);

    if (tid < TM) {
        reduced_val[tid] = MAX_DISTANCE;
        reduced_key[tid] = -1;
    }

    for (int t = start; t < end; t++) {
        const int band = t / grid_cols;
        const int row0 = band * TM;
        const int col0 = (t % grid_cols) * TN;

        if ((t == start || col0 == 0) && tid < TM) {
            rownorm_store[tid] = (row0 + tid < M) ? xn[row0 + tid] : 0.0f;
        }

        double acc[ROWS_PER_THREAD];
        for (int r = 0; r < ROWS_PER_THREAD; r++) acc[r] = 0.0;

        for (int k0 = 0; k0 < K; k0 += TK) {
            for (int idx = tid; idx < TM * TK; idx += THREADS) {
                int r = idx / TK, kk = idx % TK;
                int gr = row0 + r, gk = k0 + kk;
                smem.main_loop.a[r][kk] =
                    (gr < M && gk < K) ? x[(long long)gr * K + gk] : 0.0f;
            }
            for (int idx = tid; idx < TK * TN; idx += THREADS) {
                int kk = idx / TN, c = idx % TN;
                int gc = col0 + c, gk = k0 + kk;
                smem.main_loop.b[kk][c] =
                    (gc < N && gk < K) ? y[(long long)gc * K + gk] : 0.0f;
            }
            __syncthreads();

            for (int kk = 0; kk < TK; kk++) {
                double bv = (double)smem.main_loop.b[kk][tx];
                for (int r = 0; r < ROWS_PER_THREAD; r++) {
                    acc[r] += (double)smem.main_loop.a[ty + r * THREAD_ROWS][kk] * bv;
                }
            }
            __syncthreads();
        }
        // norms staged and main-loop reads finished before the union flips
        __syncthreads();

        const int gj = col0 + tx;
        for (int r = 0; r < ROWS_PER_THREAD; r++) {
            int i = ty + r * THREAD_ROWS;
            int gi = row0 + i;
            float d = MAX_DISTANCE;
            if (gi < M && gj < N) {
                double e = (double)rownorm_store[i] - 2.0 * acc[r] + (double)yn[gj];
                e = e > 0.0 ? e : 0.0;
                d = sqrt_out ? (float)sqrt(e) : (float)e;
            }
            smem.epilogue.dist[i][tx] = d;
        }
        __syncthreads();

        if (tid < TM) {
            float best = reduced_val[tid];
            int key = reduced_key[tid];
            for (int c = 0; c < TN && col0 + c < N; c++) {
                float d = smem.epilogue.dist[tid][c];
                if (d < best || (d == best && prefers(col0 + c, key, highest_tie))) {
                    best = d;
                    key = col0 + c;
                }
            }
            reduced_val[tid] = best;
            reduced_key[tid] = key;

            const bool band_end = col0 + TN >= N;
            if (band_end || t == end - 1) {
                const int band_start_tile = band * grid_cols;
                const int row = row0 + tid;
                if (row < M) {
                    if (band_end && band_start_tile >= start) {
                        out_val[row] = best;
                        out_key[row] = key;
                    } else {
                        int slot = blockIdx.x * 2 + (band_start_tile < start ? 0 : 1);
                        edge_val[slot * TM + tid] = best;
                        edge_key[slot * TM + tid] = key;
                        if (tid == 0) edge_band[slot] = band;
                    }
                }
                reduced_val[tid] = MAX_DISTANCE;
                reduced_key[tid] = -1;
            }
        }
        __syncthreads();
    }
}

} // extern "C"
"#;
